//! Framed peer connection.
//!
//! Wraps an already established byte stream. Both peers may issue calls and
//! answer requests over the same connection. Frames are written whole by a
//! single writer; the read loop routes response frames to their pending call
//! and queues request frames for the application.

use crate::config::{Config, ConnectionConfig};
use crate::correlation::CorrelationRegistry;
use crate::error::TransportError;
use bytes::Bytes;
use highway_protocol::{
    decode_response, BodyCodec, Decoder, Encoder, Invocation, Operation, RawFrame, Response,
    ResponseMeta, WireHeader,
};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};

/// Correlation id written on one-way requests.
pub const ONE_WAY_CORRELATION_ID: u64 = 0;

/// A request received from the peer.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub header: WireHeader,
    pub body: Bytes,
}

impl IncomingRequest {
    /// Returns whether the peer expects a response.
    pub fn expects_response(&self) -> bool {
        !self.header.flags.is_one_way()
    }
}

/// A framed connection to a peer.
pub struct Connection<S> {
    config: ConnectionConfig,
    max_frame_size: u32,
    /// Write half of the stream. One frame is written at a time.
    writer: Mutex<Option<WriteHalf<S>>>,
    /// Read half of the stream, owned by `read_loop` while it runs.
    reader: Mutex<Option<ReadHalf<S>>>,
    /// Calls waiting for responses.
    registry: CorrelationRegistry,
    incoming_tx: mpsc::Sender<IncomingRequest>,
    incoming_rx: Mutex<mpsc::Receiver<IncomingRequest>>,
    open: AtomicBool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wraps an established stream.
    pub fn new(stream: S, config: &Config) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (incoming_tx, incoming_rx) = mpsc::channel(config.connection.incoming_capacity.max(1));
        Self {
            config: config.connection.clone(),
            max_frame_size: config.codec.max_frame_size,
            writer: Mutex::new(Some(write_half)),
            reader: Mutex::new(Some(read_half)),
            registry: CorrelationRegistry::new(config.connection.max_pending_calls),
            incoming_tx,
            incoming_rx: Mutex::new(incoming_rx),
            open: AtomicBool::new(true),
        }
    }

    /// Sends a request and waits for its response.
    ///
    /// Context carried by the response header is merged into the
    /// invocation's context.
    pub async fn call<O>(
        &self,
        operation: &O,
        invocation: &mut Invocation<O::Args>,
    ) -> Result<Response<O::Output>, TransportError>
    where
        O: Operation + ?Sized,
    {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }

        let (id, rx) = self.registry.register()?;
        let encoded = match Encoder::encode_request(id, invocation, operation) {
            Ok(encoded) => encoded,
            Err(e) => {
                self.registry.cancel(id);
                return Err(e.into());
            }
        };

        tracing::debug!(
            "Sending request id={} op={} ({} bytes)",
            id,
            operation.name(),
            encoded.len()
        );
        if let Err(e) = self.write_frame(&encoded).await {
            self.registry.cancel(id);
            return Err(e);
        }

        let frame = match tokio::time::timeout(self.config.request_timeout(), rx).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(_)) => {
                tracing::debug!("Request id={} lost its connection", id);
                return Err(TransportError::ConnectionClosed);
            }
            Err(_) => {
                tracing::debug!("Request id={} timed out", id);
                self.registry.cancel(id);
                return Err(TransportError::Timeout);
            }
        };

        let response = decode_response(
            &frame.header,
            frame.body,
            operation.response_codec(),
            Some(invocation.context_map_mut()),
        )?;
        tracing::debug!("Request id={} got response ok={}", id, response.is_ok());
        Ok(response)
    }

    /// Sends a one-way request. No response is expected or awaited.
    pub async fn notify<O>(
        &self,
        operation: &O,
        invocation: &Invocation<O::Args>,
    ) -> Result<(), TransportError>
    where
        O: Operation + ?Sized,
    {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        let encoded = Encoder::encode_one_way(ONE_WAY_CORRELATION_ID, invocation, operation)?;
        tracing::debug!("Sending one-way op={}", operation.name());
        self.write_frame(&encoded).await
    }

    /// Answers a request received through [`Connection::next_request`].
    pub async fn respond<T>(
        &self,
        correlation_id: u64,
        meta: Option<&ResponseMeta>,
        serializer: &(dyn BodyCodec<T> + Sync),
        data: &T,
    ) -> Result<(), TransportError>
    where
        T: Sync,
    {
        let encoded = Encoder::encode_response(correlation_id, meta, serializer, data)?;
        tracing::debug!(
            "Sending response id={} ({} bytes)",
            correlation_id,
            encoded.len()
        );
        self.write_frame(&encoded).await
    }

    /// Waits for the next request from the peer.
    ///
    /// Returns `None` once the read loop has stopped and the queue is drained.
    ///
    /// Requests and responses share one inbound stream. When the queue holds
    /// `incoming_capacity` undrained requests the read loop stops reading, so
    /// responses to this side's own calls stall behind them until requests
    /// are taken off the queue.
    pub async fn next_request(&self) -> Option<IncomingRequest> {
        self.incoming_rx.lock().await.recv().await
    }

    /// Reads and dispatches frames until the connection fails (call this in a
    /// background task).
    ///
    /// Framing errors are fatal: every pending call is failed and the error is
    /// returned so the owner can drop the stream.
    pub async fn read_loop(&self) -> Result<(), TransportError> {
        tracing::debug!("read_loop started");
        let mut reader_guard = self.reader.lock().await;
        let reader = reader_guard
            .as_mut()
            .ok_or(TransportError::ConnectionClosed)?;

        let mut decoder = Decoder::new().with_max_frame_size(self.max_frame_size);
        let mut buf = vec![0u8; self.config.read_buffer_size()];

        let result = loop {
            let n = match reader.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => break Err(TransportError::Io(e)),
            };

            if n == 0 {
                tracing::debug!("read_loop: connection closed");
                break Err(TransportError::ConnectionClosed);
            }

            tracing::trace!("read_loop: received {} bytes", n);
            decoder.extend(&buf[..n]);

            if let Err(e) = self.drain_frames(&mut decoder).await {
                break Err(e);
            }
        };

        // Nothing after a failed frame can be trusted
        reader_guard.take();
        self.open.store(false, Ordering::SeqCst);
        let failed = self.registry.fail_all();

        if let Err(ref e) = result {
            if e.is_connection_fatal() && !matches!(e, TransportError::ConnectionClosed) {
                tracing::error!("read_loop: {} ({} pending calls failed)", e, failed);
            }
        }
        result
    }

    async fn drain_frames(&self, decoder: &mut Decoder) -> Result<(), TransportError> {
        while let Some(frame) = decoder.decode_frame()? {
            self.dispatch(frame).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, frame: RawFrame) -> Result<(), TransportError> {
        let header = frame.decode_header()?;

        if header.is_response() {
            tracing::debug!("read_loop: dispatching response id={}", header.correlation_id);
            self.registry.complete(header.correlation_id, frame);
            return Ok(());
        }

        tracing::debug!(
            "read_loop: queueing request id={} op={}",
            header.correlation_id,
            header.operation
        );
        let request = IncomingRequest {
            header,
            body: frame.body,
        };
        // Blocks reading while the queue is full
        if self.incoming_tx.send(request).await.is_err() {
            tracing::warn!("read_loop: request queue closed, dropping request");
        }
        Ok(())
    }

    async fn write_frame(&self, encoded: &[u8]) -> Result<(), TransportError> {
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard
            .as_mut()
            .ok_or(TransportError::ConnectionClosed)?;
        writer.write_all(encoded).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Returns whether the connection still accepts calls.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Returns the number of calls awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.registry.pending_count()
    }

    /// Closes the write side and fails pending calls.
    pub async fn close(&self) -> Result<(), TransportError> {
        tracing::debug!("Closing connection...");
        self.open.store(false, Ordering::SeqCst);

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        let failed = self.registry.fail_all();
        tracing::debug!("Connection closed, {} pending calls failed", failed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use highway_protocol::{
        decode_request, JsonCodec, OperationDescriptor, ProtocolError, ResponseBody,
        ResponseStatus, MAGIC,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    type EchoOp = OperationDescriptor<String, String>;

    fn echo_op() -> EchoOp {
        OperationDescriptor::json("echo.say")
    }

    fn pair(config: &Config) -> (Arc<Connection<DuplexStream>>, Arc<Connection<DuplexStream>>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = Arc::new(Connection::new(a, config));
        let server = Arc::new(Connection::new(b, config));
        for conn in [&client, &server] {
            let conn = conn.clone();
            tokio::spawn(async move {
                let _ = conn.read_loop().await;
            });
        }
        (client, server)
    }

    /// Echoes every request back, tagging the response context with the
    /// server's span id.
    fn spawn_echo_server(server: Arc<Connection<DuplexStream>>) {
        tokio::spawn(async move {
            let op = echo_op();
            let codec = JsonCodec::<String>::new();
            while let Some(request) = server.next_request().await {
                let mut invocation = Invocation::new();
                decode_request(&mut invocation, &request.header, &op, &request.body).unwrap();
                if !request.expects_response() {
                    continue;
                }
                let reply = format!("echo: {}", invocation.args().unwrap());
                let meta = ResponseMeta::ok()
                    .with_context([("X-B3-spanId", "server-span")].into_iter().collect());
                let id = request.header.correlation_id;
                server
                    .respond::<String>(id, Some(&meta), &codec, &reply)
                    .await
                    .unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let (client, server) = pair(&Config::default());
        spawn_echo_server(server);

        let op = echo_op();
        let mut invocation = Invocation::with_args("hello".to_string());
        invocation.add_context("X-B3-traceId", "trace-1");

        let response = client.call(&op, &mut invocation).await.unwrap();
        assert_eq!(response.status, ResponseStatus::Ok);
        assert_eq!(response.into_result().unwrap(), "echo: hello");

        // Local context survives, response context is merged in
        assert_eq!(invocation.context("X-B3-traceId"), Some("trace-1"));
        assert_eq!(invocation.context("X-B3-spanId"), Some("server-span"));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_calls_out_of_order() {
        let (client, server) = pair(&Config::default());

        // Answer both requests in reverse arrival order
        tokio::spawn(async move {
            let codec = JsonCodec::<String>::new();
            let first = server.next_request().await.unwrap();
            let second = server.next_request().await.unwrap();
            for request in [second, first] {
                let body: String = serde_json::from_slice(&request.body).unwrap();
                server
                    .respond::<String>(request.header.correlation_id, None, &codec, &body)
                    .await
                    .unwrap();
            }
        });

        let op = echo_op();
        let mut a = Invocation::with_args("a".to_string());
        let mut b = Invocation::with_args("b".to_string());
        let (ra, rb) = tokio::join!(client.call(&op, &mut a), client.call(&op, &mut b));

        assert_eq!(ra.unwrap().into_result().unwrap(), "a");
        assert_eq!(rb.unwrap().into_result().unwrap(), "b");
    }

    #[tokio::test]
    async fn test_failure_response() {
        let (client, server) = pair(&Config::default());
        tokio::spawn(async move {
            let codec = JsonCodec::<String>::new();
            let request = server.next_request().await.unwrap();
            server
                .respond::<String>(
                    request.header.correlation_id,
                    Some(&ResponseMeta::failure()),
                    &codec,
                    &"no such user".to_string(),
                )
                .await
                .unwrap();
        });

        let op = echo_op();
        let mut invocation = Invocation::with_args("u42".to_string());
        let response = client.call(&op, &mut invocation).await.unwrap();

        assert!(!response.is_ok());
        match response.body {
            ResponseBody::Failure(payload) => {
                assert_eq!(payload.as_ref(), br#""no such user""#)
            }
            ResponseBody::Value(_) => panic!("expected failure payload"),
        }
    }

    #[tokio::test]
    async fn test_one_way_notify() {
        let (client, server) = pair(&Config::default());

        let op = echo_op();
        let mut invocation = Invocation::with_args("fire".to_string());
        invocation.add_context("tenant", "acme");
        client.notify(&op, &invocation).await.unwrap();

        let request = server.next_request().await.unwrap();
        assert!(!request.expects_response());
        assert_eq!(request.header.correlation_id, ONE_WAY_CORRELATION_ID);
        assert_eq!(request.header.operation, "echo.say");
        assert_eq!(request.header.context.get("tenant"), Some("acme"));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_call_timeout() {
        let mut config = Config::default();
        config.connection = config
            .connection
            .with_request_timeout(Duration::from_millis(50));
        let (client, _server) = pair(&config);

        let op = echo_op();
        let mut invocation = Invocation::with_args("silence".to_string());
        let result = client.call(&op, &mut invocation).await;

        assert!(matches!(result, Err(TransportError::Timeout)));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_call_without_args_is_call_fatal_only() {
        let (client, server) = pair(&Config::default());
        spawn_echo_server(server);

        let op = echo_op();
        let mut empty = Invocation::new();
        let result = client.call(&op, &mut empty).await;
        assert!(matches!(
            result,
            Err(TransportError::Protocol(ProtocolError::Serialization(_)))
        ));
        assert_eq!(client.pending_count(), 0);

        // The connection is still usable
        let mut invocation = Invocation::with_args("again".to_string());
        let response = client.call(&op, &mut invocation).await.unwrap();
        assert_eq!(response.into_result().unwrap(), "echo: again");
    }

    #[tokio::test]
    async fn test_peer_eof_fails_pending_calls() {
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        let client = Arc::new(Connection::new(a, &Config::default()));
        let reader = client.clone();
        let read_task = tokio::spawn(async move { reader.read_loop().await });

        let caller = client.clone();
        let call_task = tokio::spawn(async move {
            let op = echo_op();
            let mut invocation = Invocation::with_args("lost".to_string());
            caller.call(&op, &mut invocation).await
        });

        // Wait for the request to hit the wire, then hang up
        let mut prefix = [0u8; 7];
        b.read_exact(&mut prefix).await.unwrap();
        assert_eq!(prefix, MAGIC);
        drop(b);

        let result = call_task.await.unwrap();
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
        assert!(matches!(
            read_task.await.unwrap(),
            Err(TransportError::ConnectionClosed)
        ));
        assert!(!client.is_open());
    }

    #[tokio::test]
    async fn test_protocol_mismatch_is_fatal() {
        let stream = tokio_test::io::Builder::new()
            .read(b"GET / HTTP/1.1\r\n")
            .build();
        let conn = Connection::new(stream, &Config::default());

        let result = conn.read_loop().await;
        assert!(matches!(
            result,
            Err(TransportError::Protocol(ProtocolError::ProtocolMismatch(_)))
        ));
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_no_registration_after_fatal_read() {
        let stream = tokio_test::io::Builder::new().read(b"HWX").build();
        let conn = Connection::new(stream, &Config::default());
        assert!(conn.read_loop().await.is_err());

        // A call racing the teardown cannot leave a waiter behind
        assert!(matches!(
            conn.registry.register(),
            Err(TransportError::ConnectionClosed)
        ));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_full_request_queue_stalls_responses() {
        let mut config = Config::default();
        config.connection.incoming_capacity = 1;
        config.connection = config
            .connection
            .with_request_timeout(Duration::from_millis(100));
        let (client, server) = pair(&config);
        spawn_echo_server(client.clone());

        // Two undrained requests fill the server's queue and park its reader
        let op = echo_op();
        for msg in ["one", "two"] {
            let invocation = Invocation::with_args(msg.to_string());
            client.notify(&op, &invocation).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut stalled = Invocation::with_args("ping".to_string());
        let result = server.call(&op, &mut stalled).await;
        assert!(matches!(result, Err(TransportError::Timeout)));

        // Draining the queue lets the reader resume
        assert!(server.next_request().await.is_some());
        assert!(server.next_request().await.is_some());

        let mut invocation = Invocation::with_args("pong".to_string());
        let response = server.call(&op, &mut invocation).await.unwrap();
        assert_eq!(response.into_result().unwrap(), "echo: pong");
    }

    #[tokio::test]
    async fn test_partial_reads_reassembled() {
        let op = echo_op();
        let mut invocation = Invocation::with_args("split".to_string());
        invocation.add_context("X-B3-traceId", "t");
        let encoded = Encoder::encode_request(9, &invocation, &op).unwrap();

        let stream = tokio_test::io::Builder::new()
            .read(&encoded[..3])
            .read(&encoded[3..20])
            .read(&encoded[20..])
            .build();
        let conn = Connection::new(stream, &Config::default());

        let result = conn.read_loop().await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));

        let request = conn.next_request().await.unwrap();
        assert_eq!(request.header.correlation_id, 9);
        assert_eq!(request.header.context.get("X-B3-traceId"), Some("t"));
        let mut received = Invocation::new();
        decode_request(&mut received, &request.header, &op, &request.body).unwrap();
        assert_eq!(received.args().map(String::as_str), Some("split"));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_fatal() {
        let codec = JsonCodec::<String>::new();
        let encoded =
            Encoder::encode_response::<String>(1, None, &codec, &"x".repeat(4096)).unwrap();

        let stream = tokio_test::io::Builder::new().read(&encoded).build();
        let mut config = Config::default();
        config.codec.max_frame_size = 1024;
        let conn = Connection::new(stream, &config);

        let result = conn.read_loop().await;
        assert!(matches!(
            result,
            Err(TransportError::Protocol(ProtocolError::FrameTooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn test_malformed_header_is_fatal() {
        let mut encoded = bytes::BytesMut::new();
        highway_protocol::write_frame(&mut encoded, b"\x00\x01\x02", b"{}").unwrap();

        let stream = tokio_test::io::Builder::new().read(&encoded).build();
        let conn = Connection::new(stream, &Config::default());

        let result = conn.read_loop().await;
        assert!(matches!(
            result,
            Err(TransportError::Protocol(ProtocolError::MalformedHeader(_)))
        ));
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_calls() {
        let (client, _server) = pair(&Config::default());
        client.close().await.unwrap();
        assert!(!client.is_open());

        let op = echo_op();
        let mut invocation = Invocation::with_args("late".to_string());
        let result = client.call(&op, &mut invocation).await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
        assert_eq!(client.pending_count(), 0);
    }
}
