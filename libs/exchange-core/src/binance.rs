//! Binance USD-M futures adapter: public WebSocket streams plus signed
//! REST for the trading surface.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use market_types::{
    topic_symbol, AggressorSide, BookLevel, OrderBookSnapshot, OrderKind, OrderSide, OrderStatus,
    TickerSnapshot, TradeEvent,
};
use serde_json::Value;
use sha2::Sha256;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::adapter::{
    AccountBalance, ExchangeAdapter, ExchangeError, MarketInfo, OrderAck, OrderRequest, WatchStream,
};
use crate::client_cache::{ClientCache, DEFAULT_CLIENT_TTL};
use crate::credentials::{CredentialHandle, CredentialVault};
use crate::Result;

const REST_BASE: &str = "https://fapi.binance.com";
const WS_BASE: &str = "wss://fstream.binance.com";
const RECV_WINDOW_MS: u64 = 5_000;

type HmacSha256 = Hmac<Sha256>;

/// Compiled per-credential client: a reqwest handle plus signing keys.
struct SignedClient {
    http: reqwest::Client,
    api_key: String,
    api_secret: String,
}

impl SignedClient {
    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        base: &str,
        path: &str,
        mut params: Vec<(String, String)>,
    ) -> Result<Value> {
        params.push(("timestamp".into(), chrono::Utc::now().timestamp_millis().to_string()));
        params.push(("recvWindow".into(), RECV_WINDOW_MS.to_string()));
        let query: String = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&query);
        let url = format!("{base}{path}?{query}&signature={signature}");

        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;
        read_response(response).await
    }
}

pub struct BinanceAdapter {
    id: String,
    rest_base: String,
    ws_base: String,
    http: reqwest::Client,
    vault: Arc<dyn CredentialVault>,
    clients: ClientCache<SignedClient>,
    request_timeout: Duration,
}

impl BinanceAdapter {
    pub fn new(vault: Arc<dyn CredentialVault>) -> Result<Self> {
        Self::with_endpoints(vault, REST_BASE, WS_BASE, Duration::from_secs(30), DEFAULT_CLIENT_TTL)
    }

    pub fn with_endpoints(
        vault: Arc<dyn CredentialVault>,
        rest_base: &str,
        ws_base: &str,
        request_timeout: Duration,
        client_ttl: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ExchangeError::Fatal(format!("http client: {e}")))?;
        Ok(Self {
            id: "binance".to_string(),
            rest_base: rest_base.to_string(),
            ws_base: ws_base.to_string(),
            http,
            vault,
            clients: ClientCache::new(client_ttl),
            request_timeout,
        })
    }

    async fn client(&self, credential: &CredentialHandle) -> Result<Arc<SignedClient>> {
        let timeout = self.request_timeout;
        let vault = Arc::clone(&self.vault);
        let handle = *credential;
        self.clients
            .get_or_build(credential.id, || async move {
                let creds = vault.resolve(&handle).await?;
                let http = reqwest::Client::builder()
                    .timeout(timeout)
                    .build()
                    .map_err(|e| ExchangeError::Fatal(format!("http client: {e}")))?;
                Ok(SignedClient {
                    http,
                    api_key: creds.api_key,
                    api_secret: creds.api_secret,
                })
            })
            .await
    }

    async fn public_get(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let response = self
            .http
            .get(format!("{}{}", self.rest_base, path))
            .query(query)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;
        read_response(response).await
    }

    fn stream_url(&self, symbol: &str, channel: &str) -> String {
        format!("{}/ws/{}@{}", self.ws_base, topic_symbol(symbol).to_lowercase(), channel)
    }

    async fn watch_channel<T, F>(&self, symbol: &str, channel: &str, parse: F) -> Result<WatchStream<T>>
    where
        T: Send + 'static,
        F: Fn(&Value) -> Option<T> + Send + Sync + 'static,
    {
        let url = self.stream_url(symbol, channel);
        let (ws, _) = connect_async(&url)
            .await
            .map_err(|e| ExchangeError::Transient(format!("ws connect {url}: {e}")))?;
        debug!(%url, "watch stream connected");

        let parse = Arc::new(parse);
        let stream = futures::stream::unfold(Some(ws), move |state| {
            let parse = Arc::clone(&parse);
            async move {
                let mut ws = state?;
                loop {
                    match ws.next().await {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<Value>(&text) {
                                Ok(value) => {
                                    if let Some(item) = (*parse)(&value) {
                                        return Some((Ok(item), Some(ws)));
                                    }
                                }
                                Err(e) => warn!(error = %e, "unparseable stream frame"),
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if ws.send(Message::Pong(payload)).await.is_err() {
                                return Some((
                                    Err(ExchangeError::Transient("pong send failed".into())),
                                    None,
                                ));
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Some((
                                Err(ExchangeError::Transient("stream closed".into())),
                                None,
                            ));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Some((Err(ExchangeError::Transient(e.to_string())), None));
                        }
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn exchange_id(&self) -> &str {
        &self.id
    }

    async fn fetch_markets(&self) -> Result<Vec<MarketInfo>> {
        let value = self.public_get("/fapi/v1/exchangeInfo", &[]).await?;
        let symbols = value
            .get("symbols")
            .and_then(Value::as_array)
            .ok_or_else(|| ExchangeError::Transient("malformed exchangeInfo".into()))?;

        let mut markets = Vec::with_capacity(symbols.len());
        for entry in symbols {
            let Some(symbol) = entry.get("symbol").and_then(Value::as_str) else { continue };
            let quote_asset = entry
                .get("quoteAsset")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let price_tick = entry
                .get("filters")
                .and_then(Value::as_array)
                .and_then(|filters| {
                    filters.iter().find(|f| {
                        f.get("filterType").and_then(Value::as_str) == Some("PRICE_FILTER")
                    })
                })
                .and_then(|f| num_field(f, "tickSize"))
                .unwrap_or(0.01);
            markets.push(MarketInfo {
                symbol: symbol.to_string(),
                price_tick,
                quote_asset,
            });
        }
        Ok(markets)
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<TickerSnapshot> {
        let value = self
            .public_get("/fapi/v1/ticker/24hr", &[("symbol", topic_symbol(symbol))])
            .await?;
        parse_rest_ticker(&self.id, symbol, &value)
            .ok_or_else(|| ExchangeError::Transient("malformed ticker".into()))
    }

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBookSnapshot> {
        let value = self
            .public_get(
                "/fapi/v1/depth",
                &[("symbol", topic_symbol(symbol)), ("limit", depth.to_string())],
            )
            .await?;
        parse_depth(&self.id, symbol, &value)
            .ok_or_else(|| ExchangeError::Transient("malformed depth".into()))
    }

    async fn fetch_balance(&self, credential: &CredentialHandle) -> Result<AccountBalance> {
        let client = self.client(credential).await?;
        let value = client
            .signed_request(reqwest::Method::GET, &self.rest_base, "/fapi/v2/balance", vec![])
            .await?;
        let entries = value
            .as_array()
            .ok_or_else(|| ExchangeError::Transient("malformed balance".into()))?;
        let mut balance = AccountBalance::default();
        for entry in entries {
            if let (Some(asset), Some(free)) = (
                entry.get("asset").and_then(Value::as_str),
                num_field(entry, "availableBalance"),
            ) {
                balance.assets.insert(asset.to_string(), free);
            }
        }
        Ok(balance)
    }

    async fn create_order(
        &self,
        credential: &CredentialHandle,
        request: &OrderRequest,
    ) -> Result<OrderAck> {
        let client = self.client(credential).await?;
        let mut params = vec![
            ("symbol".to_string(), topic_symbol(&request.symbol)),
            (
                "side".to_string(),
                match request.side {
                    OrderSide::Buy => "BUY".to_string(),
                    OrderSide::Sell => "SELL".to_string(),
                },
            ),
            (
                "type".to_string(),
                match request.kind {
                    OrderKind::Market => "MARKET".to_string(),
                    OrderKind::Limit => "LIMIT".to_string(),
                },
            ),
            ("quantity".to_string(), format_qty(request.quantity)),
            ("newClientOrderId".to_string(), request.client_order_id.clone()),
        ];
        if request.kind == OrderKind::Limit {
            let price = request
                .price
                .ok_or_else(|| ExchangeError::InvalidOrder("limit order without price".into()))?;
            params.push(("price".to_string(), format_qty(price)));
            params.push(("timeInForce".to_string(), "GTC".to_string()));
        }

        let value = client
            .signed_request(reqwest::Method::POST, &self.rest_base, "/fapi/v1/order", params)
            .await?;
        parse_order_ack(&value).ok_or_else(|| ExchangeError::Transient("malformed order ack".into()))
    }

    async fn fetch_order(
        &self,
        credential: &CredentialHandle,
        symbol: &str,
        exchange_order_id: &str,
    ) -> Result<OrderAck> {
        let client = self.client(credential).await?;
        let value = client
            .signed_request(
                reqwest::Method::GET,
                &self.rest_base,
                "/fapi/v1/order",
                vec![
                    ("symbol".to_string(), topic_symbol(symbol)),
                    ("orderId".to_string(), exchange_order_id.to_string()),
                ],
            )
            .await?;
        parse_order_ack(&value).ok_or_else(|| ExchangeError::Transient("malformed order".into()))
    }

    async fn cancel_order(
        &self,
        credential: &CredentialHandle,
        symbol: &str,
        exchange_order_id: &str,
    ) -> Result<()> {
        let client = self.client(credential).await?;
        client
            .signed_request(
                reqwest::Method::DELETE,
                &self.rest_base,
                "/fapi/v1/order",
                vec![
                    ("symbol".to_string(), topic_symbol(symbol)),
                    ("orderId".to_string(), exchange_order_id.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn watch_order_book(&self, symbol: &str) -> Result<WatchStream<OrderBookSnapshot>> {
        let exchange = self.id.clone();
        let symbol_owned = symbol.to_string();
        self.watch_channel(symbol, "depth20@100ms", move |value| {
            parse_depth(&exchange, &symbol_owned, value)
        })
        .await
    }

    async fn watch_trades(&self, symbol: &str) -> Result<WatchStream<TradeEvent>> {
        let exchange = self.id.clone();
        let symbol_owned = symbol.to_string();
        self.watch_channel(symbol, "aggTrade", move |value| {
            parse_agg_trade(&exchange, &symbol_owned, value)
        })
        .await
    }

    async fn watch_ticker(&self, symbol: &str) -> Result<WatchStream<TickerSnapshot>> {
        let exchange = self.id.clone();
        let symbol_owned = symbol.to_string();
        self.watch_channel(symbol, "miniTicker", move |value| {
            parse_mini_ticker(&exchange, &symbol_owned, value)
        })
        .await
    }
}

// ==================== RESPONSE HANDLING ====================

async fn read_response(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);
    let body: Value = response
        .json()
        .await
        .map_err(|e| ExchangeError::Transient(e.to_string()))?;

    if status.is_success() {
        return Ok(body);
    }
    let code = body.get("code").and_then(Value::as_i64).unwrap_or(0);
    let msg = body.get("msg").and_then(Value::as_str).unwrap_or("").to_string();
    Err(map_api_error(status, code, &msg, retry_after))
}

fn map_api_error(
    status: reqwest::StatusCode,
    code: i64,
    msg: &str,
    retry_after: Option<Duration>,
) -> ExchangeError {
    if status.as_u16() == 429 || status.as_u16() == 418 || code == -1003 {
        return ExchangeError::RateLimited {
            retry_after: retry_after.unwrap_or(Duration::from_secs(1)),
        };
    }
    match code {
        -2014 | -2015 | -1022 => ExchangeError::Auth(msg.to_string()),
        -2010 | -2019 => ExchangeError::InsufficientFunds(msg.to_string()),
        -1021 => ExchangeError::Transient(msg.to_string()),
        -1111 | -1121 | -1102 | -1106 | -2011 | -4003 | -4164 => {
            ExchangeError::InvalidOrder(msg.to_string())
        }
        _ if status.is_server_error() => ExchangeError::Transient(msg.to_string()),
        _ => ExchangeError::InvalidOrder(format!("{code}: {msg}")),
    }
}

// ==================== PAYLOAD PARSING ====================

/// Binance mixes quoted and bare numbers; accept both.
fn num(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn num_field(value: &Value, key: &str) -> Option<f64> {
    value.get(key).and_then(num)
}

fn format_qty(quantity: f64) -> String {
    let formatted = format!("{quantity:.8}");
    formatted.trim_end_matches('0').trim_end_matches('.').to_string()
}

fn parse_levels(value: &Value) -> Option<Vec<BookLevel>> {
    let entries = value.as_array()?;
    let mut levels = Vec::with_capacity(entries.len());
    for entry in entries {
        let pair = entry.as_array()?;
        levels.push(BookLevel::new(num(pair.first()?)?, num(pair.get(1)?)?));
    }
    Some(levels)
}

pub(crate) fn parse_depth(exchange: &str, symbol: &str, value: &Value) -> Option<OrderBookSnapshot> {
    // REST uses bids/asks, the futures stream uses b/a
    let bids = value.get("bids").or_else(|| value.get("b"))?;
    let asks = value.get("asks").or_else(|| value.get("a"))?;
    let timestamp = value
        .get("E")
        .or_else(|| value.get("T"))
        .and_then(Value::as_i64)
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
    Some(OrderBookSnapshot {
        exchange: exchange.to_string(),
        symbol: symbol.to_string(),
        timestamp,
        bids: parse_levels(bids)?,
        asks: parse_levels(asks)?,
        sequence: value.get("lastUpdateId").or_else(|| value.get("u")).and_then(Value::as_u64),
    })
}

pub(crate) fn parse_agg_trade(exchange: &str, symbol: &str, value: &Value) -> Option<TradeEvent> {
    if value.get("e").and_then(Value::as_str) != Some("aggTrade") {
        return None;
    }
    let buyer_is_maker = value.get("m").and_then(Value::as_bool)?;
    Some(TradeEvent {
        exchange: exchange.to_string(),
        symbol: symbol.to_string(),
        timestamp: value.get("T").and_then(Value::as_i64)?,
        trade_id: value.get("a").and_then(Value::as_i64)?.to_string(),
        price: num_field(value, "p")?,
        quantity: num_field(value, "q")?,
        // buyer as maker means the seller was the aggressor
        side: if buyer_is_maker { AggressorSide::Sell } else { AggressorSide::Buy },
        is_maker: Some(buyer_is_maker),
    })
}

pub(crate) fn parse_mini_ticker(exchange: &str, symbol: &str, value: &Value) -> Option<TickerSnapshot> {
    if value.get("e").and_then(Value::as_str) != Some("24hrMiniTicker") {
        return None;
    }
    Some(TickerSnapshot {
        exchange: exchange.to_string(),
        symbol: symbol.to_string(),
        timestamp: value.get("E").and_then(Value::as_i64)?,
        open: num_field(value, "o")?,
        high: num_field(value, "h")?,
        low: num_field(value, "l")?,
        last: num_field(value, "c")?,
        base_volume: num_field(value, "v")?,
        quote_volume: num_field(value, "q")?,
        best_bid: None,
        best_ask: None,
    })
}

fn parse_rest_ticker(exchange: &str, symbol: &str, value: &Value) -> Option<TickerSnapshot> {
    Some(TickerSnapshot {
        exchange: exchange.to_string(),
        symbol: symbol.to_string(),
        timestamp: value
            .get("closeTime")
            .and_then(Value::as_i64)
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
        open: num_field(value, "openPrice")?,
        high: num_field(value, "highPrice")?,
        low: num_field(value, "lowPrice")?,
        last: num_field(value, "lastPrice")?,
        base_volume: num_field(value, "volume")?,
        quote_volume: num_field(value, "quoteVolume")?,
        best_bid: None,
        best_ask: None,
    })
}

fn parse_order_ack(value: &Value) -> Option<OrderAck> {
    let status = match value.get("status").and_then(Value::as_str)? {
        "NEW" | "PARTIALLY_FILLED" => OrderStatus::Open,
        "FILLED" => OrderStatus::Closed,
        "CANCELED" | "EXPIRED" => OrderStatus::Canceled,
        _ => OrderStatus::Rejected,
    };
    let filled_quantity = num_field(value, "executedQty").unwrap_or(0.0);
    let avg_fill_price = num_field(value, "avgPrice").filter(|p| *p > 0.0);
    Some(OrderAck {
        exchange_order_id: value.get("orderId").and_then(Value::as_i64)?.to_string(),
        client_order_id: value
            .get("clientOrderId")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        status,
        requested_quantity: num_field(value, "origQty").unwrap_or(filled_quantity),
        filled_quantity,
        avg_fill_price,
        fills: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_is_deterministic_hex() {
        let client = SignedClient {
            http: reqwest::Client::new(),
            api_key: "key".into(),
            api_secret: "secret".into(),
        };
        let a = client.sign("symbol=BTCUSDT&side=BUY");
        let b = client.sign("symbol=BTCUSDT&side=BUY");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        let other = SignedClient {
            http: reqwest::Client::new(),
            api_key: "key".into(),
            api_secret: "other".into(),
        };
        assert_ne!(a, other.sign("symbol=BTCUSDT&side=BUY"));
    }

    #[test]
    fn test_parse_agg_trade() {
        let raw: Value = serde_json::from_str(
            r#"{"e":"aggTrade","E":1700000000100,"s":"BTCUSDT","a":12345,
                "p":"100.30","q":"1.5","T":1700000000010,"m":true}"#,
        )
        .unwrap();
        let trade = parse_agg_trade("binance", "BTC/USDT", &raw).unwrap();
        assert_eq!(trade.trade_id, "12345");
        assert_eq!(trade.price, 100.30);
        assert_eq!(trade.quantity, 1.5);
        assert_eq!(trade.timestamp, 1_700_000_000_010);
        // buyer was maker, so the aggressor sold
        assert_eq!(trade.side, AggressorSide::Sell);
    }

    #[test]
    fn test_parse_depth_rest_and_stream_shapes() {
        let rest: Value = serde_json::from_str(
            r#"{"lastUpdateId":99,"E":1700000000000,
                "bids":[["100.0","2.0"],["99.5","1.0"]],
                "asks":[["100.5","1.5"]]}"#,
        )
        .unwrap();
        let book = parse_depth("binance", "BTC/USDT", &rest).unwrap();
        assert_eq!(book.bids.len(), 2);
        assert_eq!(book.best_ask(), Some(100.5));
        assert_eq!(book.sequence, Some(99));

        let stream: Value = serde_json::from_str(
            r#"{"e":"depthUpdate","E":1700000000000,"s":"BTCUSDT",
                "b":[["100.0","2.0"]],"a":[["100.5","1.5"]],"u":123}"#,
        )
        .unwrap();
        let book = parse_depth("binance", "BTC/USDT", &stream).unwrap();
        assert_eq!(book.best_bid(), Some(100.0));
    }

    #[test]
    fn test_parse_mini_ticker() {
        let raw: Value = serde_json::from_str(
            r#"{"e":"24hrMiniTicker","E":1700000000000,"s":"BTCUSDT",
                "c":"100.5","o":"99.0","h":"101.0","l":"98.5","v":"1000","q":"100000"}"#,
        )
        .unwrap();
        let ticker = parse_mini_ticker("binance", "BTC/USDT", &raw).unwrap();
        assert_eq!(ticker.last, 100.5);
        assert!(ticker.validate().is_ok());
    }

    #[test]
    fn test_parse_order_ack_statuses() {
        let raw: Value = serde_json::from_str(
            r#"{"orderId":4567,"clientOrderId":"tp-abc","status":"FILLED",
                "origQty":"0.10","executedQty":"0.10","avgPrice":"100.50"}"#,
        )
        .unwrap();
        let ack = parse_order_ack(&raw).unwrap();
        assert_eq!(ack.exchange_order_id, "4567");
        assert_eq!(ack.status, OrderStatus::Closed);
        assert_eq!(ack.avg_fill_price, Some(100.5));

        let open: Value =
            serde_json::from_str(r#"{"orderId":1,"status":"NEW","executedQty":"0","avgPrice":"0"}"#)
                .unwrap();
        let ack = parse_order_ack(&open).unwrap();
        assert_eq!(ack.status, OrderStatus::Open);
        assert_eq!(ack.avg_fill_price, None);
    }

    #[test]
    fn test_error_mapping() {
        use reqwest::StatusCode;
        assert!(matches!(
            map_api_error(StatusCode::TOO_MANY_REQUESTS, -1003, "slow down", None),
            ExchangeError::RateLimited { .. }
        ));
        assert!(matches!(
            map_api_error(StatusCode::BAD_REQUEST, -2019, "margin", None),
            ExchangeError::InsufficientFunds(_)
        ));
        assert!(matches!(
            map_api_error(StatusCode::UNAUTHORIZED, -2014, "bad key", None),
            ExchangeError::Auth(_)
        ));
        assert!(matches!(
            map_api_error(StatusCode::INTERNAL_SERVER_ERROR, 0, "oops", None),
            ExchangeError::Transient(_)
        ));
        assert!(matches!(
            map_api_error(StatusCode::BAD_REQUEST, -1111, "precision", None),
            ExchangeError::InvalidOrder(_)
        ));
    }

    #[test]
    fn test_format_qty_trims_zeroes() {
        assert_eq!(format_qty(0.1), "0.1");
        assert_eq!(format_qty(1.0), "1");
        assert_eq!(format_qty(0.00012345), "0.00012345");
    }
}
