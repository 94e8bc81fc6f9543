mod http_transport;

pub use http_transport::HttpTransport;

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;

use crate::error::GatewayError;
use crate::protocol::upstream::UpstreamPayload;

/// Raw response body of one upstream round.
pub type UpstreamByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, GatewayError>> + Send>>;

/// Sends one round's payload and yields the raw response bytes.
///
/// Dropping the returned stream releases the underlying connection.
pub trait UpstreamTransport: Send + Sync + 'static {
    fn open_round(
        &self,
        payload: &UpstreamPayload,
    ) -> impl Future<Output = Result<UpstreamByteStream, GatewayError>> + Send;
}
