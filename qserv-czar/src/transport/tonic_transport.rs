//! Production [`Transport`] backed by `tonic`'s streaming gRPC client,
//! reusing a cached [`Channel`] per worker address the way a connection
//! pool would (mirrors `apollo-router`'s subgraph HTTP client pooling, one
//! client instance per destination kept alive across requests).

use super::{ResponseItem, ResponseStream, Transport, TransportError};
use dashmap::DashMap;
use futures::StreamExt;
use qserv_proto::{stream_item::Body, worker_dispatch_client::WorkerDispatchClient, Request};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tonic::transport::Channel;

struct InFlight {
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct TonicTransport {
    channels: DashMap<String, Channel>,
    in_flight: DashMap<(u64, i32, u32), AsyncMutex<InFlight>>,
}

impl TonicTransport {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            in_flight: DashMap::new(),
        }
    }

    async fn channel_for(&self, worker_addr: &str) -> std::result::Result<Channel, TransportError> {
        if let Some(ch) = self.channels.get(worker_addr) {
            return Ok(ch.clone());
        }
        let endpoint = tonic::transport::Endpoint::from_shared(worker_addr.to_string())
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        self.channels.insert(worker_addr.to_string(), channel.clone());
        Ok(channel)
    }
}

impl Default for TonicTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for TonicTransport {
    async fn dispatch(
        &self,
        worker_addr: &str,
        request: Request,
    ) -> std::result::Result<ResponseStream, TransportError> {
        let channel = self.channel_for(worker_addr).await?;
        let mut client = WorkerDispatchClient::new(channel);

        let key = (request.query_id as u64, request.job_id, request.attempt_count as u32);
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        self.in_flight.insert(key, AsyncMutex::new(InFlight { cancel_tx: Some(cancel_tx) }));

        let response = client
            .execute(request)
            .await
            .map_err(|status| TransportError::Rpc(status.to_string()))?;
        let inbound = response.into_inner();

        let mapped = inbound.map(move |item| match item {
            Ok(stream_item) => match stream_item.body {
                Some(Body::Header(h)) => Ok(ResponseItem::Header(h)),
                Some(Body::Result(r)) => Ok(ResponseItem::Data(r)),
                None => Err(TransportError::Rpc("empty StreamItem".into())),
            },
            Err(status) => Err(TransportError::Rpc(status.to_string())),
        });

        let guarded = async_stream_with_cancel(mapped, async move {
            let _ = (&mut cancel_rx).await;
        });

        Ok(Box::pin(guarded))
    }

    async fn cancel(&self, query_id: u64, job_id: i32, attempt_count: u32) {
        if let Some(entry) = self.in_flight.get(&(query_id, job_id, attempt_count)) {
            let mut guard = entry.lock().await;
            if let Some(tx) = guard.cancel_tx.take() {
                let _ = tx.send(());
            }
        }
    }
}

/// Wraps `inner` so that once `cancel_signal` resolves, the stream yields a
/// single `Cancelled` error and ends, instead of continuing to poll the
/// underlying gRPC stream (spec.md section 4.5: in-flight commands "observe
/// the flag at their next safe point and drop").
fn async_stream_with_cancel<S>(
    inner: S,
    cancel_signal: impl std::future::Future<Output = ()> + Send + 'static,
) -> impl futures::Stream<Item = std::result::Result<ResponseItem, TransportError>> + Send + 'static
where
    S: futures::Stream<Item = std::result::Result<ResponseItem, TransportError>> + Send + 'static,
{
    use futures::stream::{self, StreamExt as _};
    let cancel_stream = stream::once(cancel_signal).map(|_| Err(TransportError::Cancelled));
    stream::select(inner.map(Some), cancel_stream.map(Some))
        .scan(false, |done, item| {
            if *done {
                return futures::future::ready(None);
            }
            if let Some(Err(TransportError::Cancelled)) = &item {
                *done = true;
            }
            futures::future::ready(item)
        })
}
