use std::collections::HashMap;

use thiserror::Error;

/// HTTP status codes that are retried by the executor
pub const RETRYABLE_STATUS_CODES: [u16; 5] = [429, 500, 502, 503, 504];

/// Errors raised by an exchange client or market data source
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        /// Response headers, names lower-cased
        headers: HashMap<String, String>,
    },

    #[error("rate limit exceeded")]
    RateLimitExceeded,

    #[error("network failure: {0}")]
    NetworkFailure(String),

    #[error("request timed out")]
    Timeout,

    #[error("connection reset")]
    ConnectionReset,

    #[error("order not found")]
    OrderNotFound,

    #[error("symbol not supported: {0}")]
    SymbolNotSupported(String),

    #[error("invalid order request: {0}")]
    InvalidOrderRequest(String),

    #[error("exchange error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("{0}")]
    Other(String),
}

impl ExchangeError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        ExchangeError::Http {
            status,
            message: message.into(),
            headers: HashMap::new(),
        }
    }

    /// HTTP status code, when the error came from an HTTP response
    pub fn status(&self) -> Option<u16> {
        match self {
            ExchangeError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Response headers, when the error came from an HTTP response
    pub fn headers(&self) -> Option<&HashMap<String, String>> {
        match self {
            ExchangeError::Http { headers, .. } => Some(headers),
            _ => None,
        }
    }

    /// Look up one header case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers()?
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ExchangeError::RateLimitExceeded) || self.status() == Some(429)
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ExchangeError::RateLimitExceeded
            | ExchangeError::NetworkFailure(_)
            | ExchangeError::Timeout
            | ExchangeError::ConnectionReset => true,
            ExchangeError::Http { status, .. } => RETRYABLE_STATUS_CODES.contains(status),
            _ => false,
        }
    }
}

/// Errors raised by order and position stores
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("invalid record: {0}")]
    Invalid(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// Errors surfaced by the executor, the sniper and the position monitor
#[derive(Debug, Error)]
pub enum TradingError {
    #[error("operation canceled")]
    Canceled,

    #[error("retries exhausted after {attempts} attempts: {cause}")]
    RetriesExhausted { attempts: u32, cause: ExchangeError },

    #[error("permanent failure: {cause}")]
    Permanent { cause: ExchangeError },

    #[error("price {price} exceeds maximum {max}")]
    MaxPriceExceeded { price: f64, max: f64 },

    #[error("insufficient liquidity for {0}")]
    InsufficientLiquidity(String),

    #[error("concurrency limit of {limit} in-flight orders reached")]
    ConcurrencyLimit { limit: usize },

    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("service is not running")]
    NotRunning,

    #[error("invalid order request: {0}")]
    InvalidOrderRequest(String),

    #[error("symbol not supported: {0}")]
    SymbolNotSupported(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("market data error: {0}")]
    MarketData(#[source] ExchangeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl TradingError {
    /// The underlying exchange error for wrapped failures
    pub fn exchange_cause(&self) -> Option<&ExchangeError> {
        match self {
            TradingError::RetriesExhausted { cause, .. }
            | TradingError::Permanent { cause }
            | TradingError::MarketData(cause) => Some(cause),
            _ => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, TradingError::Canceled)
    }
}

pub type TradingResult<T> = std::result::Result<T, TradingError>;
