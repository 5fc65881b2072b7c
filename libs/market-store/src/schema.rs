//! Schema bootstrap. `CREATE TABLE IF NOT EXISTS` keeps startup
//! idempotent; there is no migration machinery here.

use sqlx::SqlitePool;
use tracing::debug;

use crate::Result;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS symbols (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        exchange TEXT NOT NULL,
        symbol TEXT NOT NULL,
        price_tick REAL NOT NULL,
        quote_asset TEXT NOT NULL,
        UNIQUE (exchange, symbol)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS order_books_futures (
        time INTEGER NOT NULL,
        symbol_id INTEGER NOT NULL,
        exchange TEXT NOT NULL,
        bids TEXT NOT NULL,
        asks TEXT NOT NULL,
        PRIMARY KEY (time, symbol_id, exchange)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS trades_futures (
        time INTEGER NOT NULL,
        symbol_id INTEGER NOT NULL,
        exchange TEXT NOT NULL,
        trade_id TEXT NOT NULL,
        price REAL NOT NULL,
        quantity REAL NOT NULL,
        side TEXT NOT NULL,
        is_maker INTEGER,
        PRIMARY KEY (time, symbol_id, exchange, trade_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS mini_tickers_futures (
        time INTEGER NOT NULL,
        symbol_id INTEGER NOT NULL,
        exchange TEXT NOT NULL,
        open REAL NOT NULL,
        high REAL NOT NULL,
        low REAL NOT NULL,
        close REAL NOT NULL,
        volume REAL NOT NULL,
        quote_volume REAL NOT NULL,
        PRIMARY KEY (time, symbol_id, exchange)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS footprints_futures (
        symbol_id INTEGER NOT NULL,
        exchange TEXT NOT NULL,
        interval_type TEXT NOT NULL,
        start_time INTEGER NOT NULL,
        end_time INTEGER NOT NULL,
        open_price REAL NOT NULL,
        high_price REAL NOT NULL,
        low_price REAL NOT NULL,
        close_price REAL NOT NULL,
        total_volume REAL NOT NULL,
        total_delta REAL NOT NULL,
        poc_price REAL NOT NULL,
        value_area_high REAL NOT NULL,
        value_area_low REAL NOT NULL,
        footprint_data TEXT NOT NULL,
        PRIMARY KEY (symbol_id, exchange, interval_type, start_time)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS strategies (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        owner_id INTEGER NOT NULL,
        exchange_config_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        exchange TEXT NOT NULL,
        symbol TEXT NOT NULL,
        params TEXT NOT NULL,
        desired_active INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending_start',
        health_message TEXT,
        last_eval_at INTEGER,
        consecutive_errors INTEGER NOT NULL DEFAULT 0,
        state TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE (owner_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS exchange_credentials (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        owner_id INTEGER NOT NULL,
        exchange TEXT NOT NULL,
        testnet INTEGER NOT NULL DEFAULT 0,
        api_key BLOB NOT NULL,
        api_secret BLOB NOT NULL,
        passphrase BLOB,
        active INTEGER NOT NULL DEFAULT 1,
        UNIQUE (owner_id, exchange, testnet)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS bot_orders (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        strategy_id INTEGER NOT NULL,
        user_id INTEGER NOT NULL,
        client_order_id TEXT NOT NULL UNIQUE,
        exchange_order_id TEXT NOT NULL,
        exchange TEXT NOT NULL,
        symbol_id INTEGER NOT NULL,
        type TEXT NOT NULL,
        side TEXT NOT NULL,
        price REAL,
        quantity REAL NOT NULL,
        filled_quantity REAL NOT NULL DEFAULT 0,
        avg_fill_price REAL,
        status TEXT NOT NULL,
        leverage INTEGER,
        margin_type TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE (exchange, exchange_order_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS bot_transactions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        bot_order_id INTEGER NOT NULL,
        user_id INTEGER NOT NULL,
        exchange TEXT NOT NULL,
        symbol_id INTEGER NOT NULL,
        side TEXT NOT NULL,
        trade_id TEXT NOT NULL,
        price REAL NOT NULL,
        quantity REAL NOT NULL,
        fee REAL NOT NULL DEFAULT 0,
        fee_currency TEXT NOT NULL DEFAULT '',
        transaction_time INTEGER NOT NULL,
        UNIQUE (bot_order_id, trade_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_trades_symbol_time ON trades_futures (symbol_id, time)",
    "CREATE INDEX IF NOT EXISTS idx_bot_orders_user ON bot_orders (user_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_bot_orders_strategy ON bot_orders (strategy_id, status)",
];

pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    debug!("schema initialized ({} statements)", SCHEMA.len());
    Ok(())
}
