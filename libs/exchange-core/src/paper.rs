//! Deterministic in-process exchange for tests and dry runs.
//!
//! Market orders fill instantly at the seeded touch; limit orders rest
//! unless they cross. Placements are deduplicated by client-order-id
//! within a configurable window, and errors can be scripted to exercise
//! the executor's retry policy. Watch streams are fed by pushing events
//! from the test.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use market_types::{
    OrderBookSnapshot, OrderKind, OrderSide, OrderStatus, TickerSnapshot, TradeEvent,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::adapter::{
    AccountBalance, ExchangeAdapter, ExchangeError, FillEvent, MarketInfo, OrderAck, OrderRequest,
    WatchStream,
};
use crate::credentials::CredentialHandle;
use crate::Result;

const FEED_CAPACITY: usize = 1024;

type Feed<T> = DashMap<String, broadcast::Sender<Result<T>>>;

pub struct PaperExchange {
    id: String,
    markets: DashMap<String, MarketInfo>,
    books: DashMap<String, OrderBookSnapshot>,
    tickers: DashMap<String, TickerSnapshot>,
    balances: DashMap<String, f64>,
    orders: DashMap<String, OrderAck>,
    dedup: DashMap<String, (OrderAck, Instant)>,
    dedup_window: Duration,
    scripted_errors: Mutex<VecDeque<ExchangeError>>,
    placements: Mutex<Vec<OrderRequest>>,
    sequence: AtomicU64,
    trade_feed: Feed<TradeEvent>,
    book_feed: Feed<OrderBookSnapshot>,
    ticker_feed: Feed<TickerSnapshot>,
}

impl PaperExchange {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            markets: DashMap::new(),
            books: DashMap::new(),
            tickers: DashMap::new(),
            balances: DashMap::new(),
            orders: DashMap::new(),
            dedup: DashMap::new(),
            dedup_window: Duration::from_secs(60),
            scripted_errors: Mutex::new(VecDeque::new()),
            placements: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
            trade_feed: DashMap::new(),
            book_feed: DashMap::new(),
            ticker_feed: DashMap::new(),
        }
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    // ==================== SEEDING ====================

    pub fn add_market(&self, symbol: &str, price_tick: f64, quote_asset: &str) {
        self.markets.insert(
            symbol.to_string(),
            MarketInfo {
                symbol: symbol.to_string(),
                price_tick,
                quote_asset: quote_asset.to_string(),
            },
        );
    }

    pub fn seed_book(&self, book: OrderBookSnapshot) {
        self.books.insert(book.symbol.clone(), book);
    }

    pub fn seed_ticker(&self, ticker: TickerSnapshot) {
        self.tickers.insert(ticker.symbol.clone(), ticker);
    }

    pub fn set_balance(&self, asset: &str, amount: f64) {
        self.balances.insert(asset.to_string(), amount);
    }

    /// Queue an error returned by the next `create_order` call.
    pub fn script_order_error(&self, error: ExchangeError) {
        self.scripted_errors.lock().push_back(error);
    }

    // ==================== FEEDING WATCHERS ====================

    fn feed_sender<T: Clone>(feed: &Feed<T>, symbol: &str) -> broadcast::Sender<Result<T>> {
        feed.entry(symbol.to_string())
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
            .clone()
    }

    /// Publish a trade to live watchers and the seeded state.
    pub fn push_trade(&self, trade: TradeEvent) {
        let _ = Self::feed_sender(&self.trade_feed, &trade.symbol).send(Ok(trade));
    }

    pub fn push_order_book(&self, book: OrderBookSnapshot) {
        self.books.insert(book.symbol.clone(), book.clone());
        let _ = Self::feed_sender(&self.book_feed, &book.symbol).send(Ok(book));
    }

    pub fn push_ticker(&self, ticker: TickerSnapshot) {
        self.tickers.insert(ticker.symbol.clone(), ticker.clone());
        let _ = Self::feed_sender(&self.ticker_feed, &ticker.symbol).send(Ok(ticker));
    }

    /// Inject a transient stream failure, as a dropped WebSocket would.
    pub fn break_trade_stream(&self, symbol: &str) {
        let _ = Self::feed_sender(&self.trade_feed, symbol)
            .send(Err(ExchangeError::Transient("injected disconnect".into())));
    }

    // ==================== INSPECTION ====================

    /// Orders actually accepted at the exchange (dedup hits excluded).
    pub fn orders_placed(&self) -> usize {
        self.placements.lock().len()
    }

    pub fn placements(&self) -> Vec<OrderRequest> {
        self.placements.lock().clone()
    }

    fn watch<T: Clone + Send + 'static>(feed: &Feed<T>, symbol: &str) -> WatchStream<T> {
        let rx = Self::feed_sender(feed, symbol).subscribe();
        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(item) => Some((item, rx)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    Some((Err(ExchangeError::Transient(format!("lagged {n} messages"))), rx))
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        }))
    }

    fn fill_price(&self, request: &OrderRequest) -> Result<f64> {
        let book = self.books.get(&request.symbol);
        match request.kind {
            OrderKind::Market => {
                let book = book.ok_or_else(|| {
                    ExchangeError::InvalidOrder(format!("no market for {}", request.symbol))
                })?;
                let touch = match request.side {
                    OrderSide::Buy => book.best_ask(),
                    OrderSide::Sell => book.best_bid(),
                };
                touch.ok_or_else(|| ExchangeError::InvalidOrder("empty book".into()))
            }
            OrderKind::Limit => request
                .price
                .ok_or_else(|| ExchangeError::InvalidOrder("limit order without price".into())),
        }
    }

    fn limit_crosses(&self, request: &OrderRequest) -> bool {
        let Some(price) = request.price else { return false };
        let Some(book) = self.books.get(&request.symbol) else { return false };
        match request.side {
            OrderSide::Buy => book.best_ask().map(|ask| price >= ask).unwrap_or(false),
            OrderSide::Sell => book.best_bid().map(|bid| price <= bid).unwrap_or(false),
        }
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    fn exchange_id(&self) -> &str {
        &self.id
    }

    async fn fetch_markets(&self) -> Result<Vec<MarketInfo>> {
        Ok(self.markets.iter().map(|e| e.value().clone()).collect())
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<TickerSnapshot> {
        self.tickers
            .get(symbol)
            .map(|t| t.clone())
            .ok_or_else(|| ExchangeError::Transient(format!("no ticker for {symbol}")))
    }

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBookSnapshot> {
        let mut book = self
            .books
            .get(symbol)
            .map(|b| b.clone())
            .ok_or_else(|| ExchangeError::Transient(format!("no book for {symbol}")))?;
        book.bids.truncate(depth);
        book.asks.truncate(depth);
        Ok(book)
    }

    async fn fetch_balance(&self, _credential: &CredentialHandle) -> Result<AccountBalance> {
        Ok(AccountBalance {
            assets: self
                .balances
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        })
    }

    async fn create_order(
        &self,
        _credential: &CredentialHandle,
        request: &OrderRequest,
    ) -> Result<OrderAck> {
        if let Some(error) = self.scripted_errors.lock().pop_front() {
            return Err(error);
        }

        if let Some(entry) = self.dedup.get(&request.client_order_id) {
            let (ack, placed_at) = entry.value();
            if placed_at.elapsed() < self.dedup_window {
                debug!(client_order_id = %request.client_order_id, "deduplicated placement");
                return Ok(ack.clone());
            }
        }

        let price = self.fill_price(request)?;
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let exchange_order_id = format!("paper-{seq}");
        let now = chrono::Utc::now().timestamp_millis();

        let filled = request.kind == OrderKind::Market || self.limit_crosses(request);
        let ack = if filled {
            OrderAck {
                exchange_order_id: exchange_order_id.clone(),
                client_order_id: request.client_order_id.clone(),
                status: OrderStatus::Closed,
                requested_quantity: request.quantity,
                filled_quantity: request.quantity,
                avg_fill_price: Some(price),
                fills: vec![FillEvent {
                    trade_id: format!("{exchange_order_id}-1"),
                    price,
                    quantity: request.quantity,
                    fee: 0.0,
                    fee_currency: self
                        .markets
                        .get(&request.symbol)
                        .map(|m| m.quote_asset.clone())
                        .unwrap_or_default(),
                    timestamp: now,
                }],
            }
        } else {
            OrderAck {
                exchange_order_id: exchange_order_id.clone(),
                client_order_id: request.client_order_id.clone(),
                status: OrderStatus::Open,
                requested_quantity: request.quantity,
                filled_quantity: 0.0,
                avg_fill_price: None,
                fills: Vec::new(),
            }
        };

        self.orders.insert(exchange_order_id, ack.clone());
        self.dedup
            .insert(request.client_order_id.clone(), (ack.clone(), Instant::now()));
        self.placements.lock().push(request.clone());
        Ok(ack)
    }

    async fn fetch_order(
        &self,
        _credential: &CredentialHandle,
        _symbol: &str,
        exchange_order_id: &str,
    ) -> Result<OrderAck> {
        self.orders
            .get(exchange_order_id)
            .map(|o| o.clone())
            .ok_or_else(|| ExchangeError::InvalidOrder(format!("unknown order {exchange_order_id}")))
    }

    async fn cancel_order(
        &self,
        _credential: &CredentialHandle,
        _symbol: &str,
        exchange_order_id: &str,
    ) -> Result<()> {
        match self.orders.get_mut(exchange_order_id) {
            Some(mut order) if order.status == OrderStatus::Open => {
                order.status = OrderStatus::Canceled;
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(ExchangeError::InvalidOrder(format!("unknown order {exchange_order_id}"))),
        }
    }

    async fn watch_order_book(&self, symbol: &str) -> Result<WatchStream<OrderBookSnapshot>> {
        Ok(Self::watch(&self.book_feed, symbol))
    }

    async fn watch_trades(&self, symbol: &str) -> Result<WatchStream<TradeEvent>> {
        Ok(Self::watch(&self.trade_feed, symbol))
    }

    async fn watch_ticker(&self, symbol: &str) -> Result<WatchStream<TickerSnapshot>> {
        Ok(Self::watch(&self.ticker_feed, symbol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use market_types::{AggressorSide, BookLevel};

    fn book(symbol: &str) -> OrderBookSnapshot {
        OrderBookSnapshot {
            exchange: "paper".into(),
            symbol: symbol.into(),
            timestamp: 1_700_000_000_000,
            bids: vec![BookLevel::new(100.0, 2.0)],
            asks: vec![BookLevel::new(100.5, 2.0)],
            sequence: None,
        }
    }

    fn order(client_id: &str) -> OrderRequest {
        OrderRequest {
            symbol: "BTC/USDT".into(),
            side: OrderSide::Buy,
            kind: OrderKind::Market,
            quantity: 0.1,
            price: None,
            client_order_id: client_id.into(),
            leverage: None,
        }
    }

    #[tokio::test]
    async fn test_market_order_fills_at_touch() {
        let exchange = PaperExchange::new("paper");
        exchange.add_market("BTC/USDT", 0.5, "USDT");
        exchange.seed_book(book("BTC/USDT"));

        let handle = CredentialHandle::new(1);
        let ack = exchange.create_order(&handle, &order("c-1")).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Closed);
        assert_eq!(ack.avg_fill_price, Some(100.5));
        assert_eq!(ack.fills.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_client_order_id_returns_same_ack() {
        let exchange = PaperExchange::new("paper");
        exchange.add_market("BTC/USDT", 0.5, "USDT");
        exchange.seed_book(book("BTC/USDT"));

        let handle = CredentialHandle::new(1);
        let first = exchange.create_order(&handle, &order("c-dup")).await.unwrap();
        let second = exchange.create_order(&handle, &order("c-dup")).await.unwrap();

        assert_eq!(first.exchange_order_id, second.exchange_order_id);
        assert_eq!(exchange.orders_placed(), 1);
    }

    #[tokio::test]
    async fn test_scripted_error_consumed_once() {
        let exchange = PaperExchange::new("paper");
        exchange.add_market("BTC/USDT", 0.5, "USDT");
        exchange.seed_book(book("BTC/USDT"));
        exchange.script_order_error(ExchangeError::Transient("flaky".into()));

        let handle = CredentialHandle::new(1);
        assert!(exchange.create_order(&handle, &order("c-1")).await.is_err());
        assert!(exchange.create_order(&handle, &order("c-1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_resting_limit_order_stays_open() {
        let exchange = PaperExchange::new("paper");
        exchange.add_market("BTC/USDT", 0.5, "USDT");
        exchange.seed_book(book("BTC/USDT"));

        let mut request = order("c-limit");
        request.kind = OrderKind::Limit;
        request.price = Some(99.0);

        let handle = CredentialHandle::new(1);
        let ack = exchange.create_order(&handle, &request).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Open);
        assert!(ack.fills.is_empty());

        exchange.cancel_order(&handle, "BTC/USDT", &ack.exchange_order_id).await.unwrap();
        let fetched = exchange
            .fetch_order(&handle, "BTC/USDT", &ack.exchange_order_id)
            .await
            .unwrap();
        assert_eq!(fetched.status, OrderStatus::Canceled);
    }

    #[tokio::test]
    async fn test_watch_trades_receives_pushes_and_breaks() {
        let exchange = PaperExchange::new("paper");
        let mut stream = exchange.watch_trades("BTC/USDT").await.unwrap();

        exchange.push_trade(TradeEvent {
            exchange: "paper".into(),
            symbol: "BTC/USDT".into(),
            timestamp: 1,
            trade_id: "t-1".into(),
            price: 100.3,
            quantity: 1.0,
            side: AggressorSide::Buy,
            is_maker: None,
        });
        exchange.break_trade_stream("BTC/USDT");

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.trade_id, "t-1");
        let second = stream.next().await.unwrap();
        assert!(matches!(second, Err(ExchangeError::Transient(_))));
    }
}
