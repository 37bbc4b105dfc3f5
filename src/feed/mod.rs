pub mod error;
pub mod fallback;
pub mod market_data_feed;
pub mod stream;
pub mod websocket;

pub use error::FeedError;
pub use fallback::{normalize_frame, ProviderChain, ProviderFrame};
pub use market_data_feed::{HistoricalQuery, MarketDataFeed, DEFAULT_PERIOD};
pub use stream::{
    backoff_delay, spawn_stream, StreamCallbacks, StreamMessage, StreamOptions, StreamSummary,
};
pub use websocket::{
    parse_batch, ConnectionStatus, MessageError, ParsedBatch, PolygonWebSocketFeed, WebSocketError,
    WebSocketOptions, WebSocketSummary,
};
