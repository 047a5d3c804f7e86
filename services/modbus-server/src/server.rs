//! Modbus TCP transport adapter
//!
//! Routes `tokio-modbus` requests into a [`ModbusHandler`]. Framing, function
//! code parsing and per-client connection tasks belong to `tokio-modbus`.

use std::future::{self, Future};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use modbus_memory::{HandlerRequest, MemoryError, ModbusException, ModbusHandler};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tokio_modbus::{
    prelude::*, Exception as ExceptionCode,
    server::tcp::{accept_tcp_connection, Server},
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, error, info, warn};

use crate::error::Result;

fn exception_code(err: &MemoryError) -> ExceptionCode {
    match err.exception() {
        ModbusException::IllegalFunction => ExceptionCode::IllegalFunction,
        ModbusException::IllegalDataAddress => ExceptionCode::IllegalDataAddress,
        ModbusException::IllegalDataValue => ExceptionCode::IllegalDataValue,
        ModbusException::ServerDeviceFailure => ExceptionCode::ServerDeviceFailure,
    }
}

fn reject(err: MemoryError) -> ExceptionCode {
    debug!("Request rejected: {}", err);
    exception_code(&err)
}

/// Per-connection service wrapping the shared handler
pub struct ModbusService<H> {
    handler: Arc<H>,
}

impl<H: ModbusHandler> ModbusService<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self { handler }
    }

    /// Serve one decoded request.
    pub fn dispatch(&self, request: Request<'_>) -> std::result::Result<Response, ExceptionCode> {
        let handler = &self.handler;
        match request {
            Request::ReadCoils(address, quantity) => handler
                .handle_coils(&HandlerRequest::read(address, quantity))
                .map(Response::ReadCoils)
                .map_err(reject),
            Request::WriteSingleCoil(address, value) => handler
                .handle_coils(&HandlerRequest::write(address, vec![value]))
                .map(|_| Response::WriteSingleCoil(address, value))
                .map_err(reject),
            Request::WriteMultipleCoils(address, values) => {
                let quantity = values.len() as u16;
                handler
                    .handle_coils(&HandlerRequest::write(address, values.into_owned()))
                    .map(|_| Response::WriteMultipleCoils(address, quantity))
                    .map_err(reject)
            },
            Request::ReadHoldingRegisters(address, quantity) => handler
                .handle_holding_registers(&HandlerRequest::read(address, quantity))
                .map(Response::ReadHoldingRegisters)
                .map_err(reject),
            Request::WriteSingleRegister(address, value) => handler
                .handle_holding_registers(&HandlerRequest::write(address, vec![value]))
                .map(|_| Response::WriteSingleRegister(address, value))
                .map_err(reject),
            Request::WriteMultipleRegisters(address, values) => {
                let quantity = values.len() as u16;
                handler
                    .handle_holding_registers(&HandlerRequest::write(address, values.into_owned()))
                    .map(|_| Response::WriteMultipleRegisters(address, quantity))
                    .map_err(reject)
            },
            Request::ReadWriteMultipleRegisters(read_address, quantity, write_address, values) => {
                // The write happens before the read
                handler
                    .handle_holding_registers(&HandlerRequest::write(
                        write_address,
                        values.into_owned(),
                    ))
                    .and_then(|_| {
                        handler
                            .handle_holding_registers(&HandlerRequest::read(read_address, quantity))
                    })
                    .map(Response::ReadWriteMultipleRegisters)
                    .map_err(reject)
            },
            Request::ReadDiscreteInputs(address, quantity) => handler
                .handle_discrete_inputs(&HandlerRequest::read(address, quantity))
                .map(Response::ReadDiscreteInputs)
                .map_err(reject),
            Request::ReadInputRegisters(address, quantity) => handler
                .handle_input_registers(&HandlerRequest::read(address, quantity))
                .map(Response::ReadInputRegisters)
                .map_err(reject),
            other => {
                debug!("Unsupported request: {:?}", other);
                Err(ExceptionCode::IllegalFunction)
            },
        }
    }
}

impl<H: ModbusHandler> tokio_modbus::server::Service for ModbusService<H> {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<std::result::Result<Self::Response, Self::Exception>>;

    fn call(&self, request: Self::Request) -> Self::Future {
        future::ready(self.dispatch(request))
    }
}

/// Connection limits of one TCP server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerOptions {
    /// Concurrent clients; zero means unlimited
    pub max_clients: usize,
    /// Close a client that sends nothing for this long
    pub idle_timeout: Option<Duration>,
}

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Client stream that ends the session on shutdown or idle timeout
///
/// `tokio-modbus` runs every session in a detached task; failing the next
/// read is the only way to stop it from the outside.
struct SessionStream {
    inner: TcpStream,
    cancel: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    idle_timeout: Option<Duration>,
    deadline: Option<Pin<Box<Sleep>>>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl SessionStream {
    fn new(
        inner: TcpStream,
        cancel: CancellationToken,
        idle_timeout: Option<Duration>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            inner,
            cancelled: Box::pin(cancel.clone().cancelled_owned()),
            cancel,
            idle_timeout,
            deadline: idle_timeout.map(|idle| Box::pin(tokio::time::sleep(idle))),
            _permit: permit,
        }
    }
}

impl AsyncRead for SessionStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() || this.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "server shutting down",
            )));
        }

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                if let (Some(idle), Some(deadline)) = (this.idle_timeout, this.deadline.as_mut()) {
                    deadline.as_mut().reset(Instant::now() + idle);
                }
                Poll::Ready(result)
            },
            Poll::Pending => match this.deadline.as_mut() {
                Some(deadline) => {
                    if deadline.as_mut().poll(cx).is_ready() {
                        Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "client idle timeout",
                        )))
                    } else {
                        Poll::Pending
                    }
                },
                None => Poll::Pending,
            },
        }
    }
}

impl AsyncWrite for SessionStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

fn on_process_error(err: io::Error) {
    match err.kind() {
        io::ErrorKind::ConnectionAborted | io::ErrorKind::TimedOut => {
            debug!("Modbus session closed: {}", err)
        },
        _ => error!("Modbus connection error: {}", err),
    }
}

/// Running TCP server
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting clients, close open sessions and wait for the accept
    /// loop to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("Modbus server task failed: {}", e);
        }
    }
}

/// Bind `listen_address` and serve `handler` until `cancel` fires.
///
/// Sessions open at cancellation are closed on their next read.
pub async fn spawn_tcp_server<H: ModbusHandler + 'static>(
    listen_address: &str,
    handler: Arc<H>,
    options: ServerOptions,
    cancel: CancellationToken,
) -> Result<ServerHandle> {
    let listener = TcpListener::bind(listen_address).await?;
    let local_addr = listener.local_addr()?;
    info!(
        "Modbus server listening on {} (max clients: {}, idle timeout: {:?})",
        local_addr,
        if options.max_clients == 0 {
            "unlimited".to_string()
        } else {
            options.max_clients.to_string()
        },
        options.idle_timeout
    );

    let limit = (options.max_clients > 0).then(|| Arc::new(Semaphore::new(options.max_clients)));
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        let server = Server::new(listener);
        let on_connected = |stream: TcpStream, socket_addr: SocketAddr| {
            let handler = Arc::clone(&handler);
            let permit = limit.as_ref().map(|sem| Arc::clone(sem).try_acquire_owned());
            let session_token = token.clone();
            async move {
                let permit = match permit {
                    Some(Ok(permit)) => Some(permit),
                    Some(Err(_)) => {
                        warn!(
                            "Refusing client {}: {} clients connected",
                            socket_addr, options.max_clients
                        );
                        return Ok(None);
                    },
                    None => None,
                };
                debug!("Client connected: {}", socket_addr);
                let accepted = accept_tcp_connection(stream, socket_addr, move |_| {
                    Ok(Some(ModbusService::new(Arc::clone(&handler))))
                })?;
                Ok(accepted.map(|(service, stream)| {
                    (
                        service,
                        SessionStream::new(stream, session_token, options.idle_timeout, permit),
                    )
                }))
            }
        };

        loop {
            tokio::select! {
                result = server.serve(&on_connected, on_process_error) => match result {
                    Ok(()) => break,
                    Err(e) => {
                        warn!("Accept failed on {}: {}", local_addr, e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    },
                },
                _ = token.cancelled() => break,
            }
        }
        info!("Modbus server on {} stopped", local_addr);
    });

    Ok(ServerHandle {
        local_addr,
        cancel,
        task,
    })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use modbus_memory::RequestHandler;
    use std::borrow::Cow;
    use tokio_modbus::client;

    fn service() -> ModbusService<RequestHandler> {
        ModbusService::new(Arc::new(RequestHandler::new(4, 0, 4, 100).unwrap()))
    }

    #[test]
    fn test_coil_requests() {
        let service = service();
        assert_eq!(
            service.dispatch(Request::WriteSingleCoil(1, true)),
            Ok(Response::WriteSingleCoil(1, true))
        );
        assert_eq!(
            service.dispatch(Request::WriteMultipleCoils(2, Cow::Owned(vec![true, false]))),
            Ok(Response::WriteMultipleCoils(2, 2))
        );
        assert_eq!(
            service.dispatch(Request::ReadCoils(0, 4)),
            Ok(Response::ReadCoils(vec![false, true, true, false]))
        );
        assert_eq!(
            service.dispatch(Request::ReadCoils(2, 4)),
            Err(ExceptionCode::IllegalDataAddress)
        );
    }

    #[test]
    fn test_register_requests() {
        let service = service();
        assert_eq!(
            service.dispatch(Request::WriteMultipleRegisters(100, Cow::Owned(vec![1, 2]))),
            Ok(Response::WriteMultipleRegisters(100, 2))
        );
        assert_eq!(
            service.dispatch(Request::WriteSingleRegister(103, 9)),
            Ok(Response::WriteSingleRegister(103, 9))
        );
        assert_eq!(
            service.dispatch(Request::ReadHoldingRegisters(100, 4)),
            Ok(Response::ReadHoldingRegisters(vec![1, 2, 0, 9]))
        );
        assert_eq!(
            service.dispatch(Request::ReadWriteMultipleRegisters(
                100,
                2,
                101,
                Cow::Owned(vec![7])
            )),
            Ok(Response::ReadWriteMultipleRegisters(vec![1, 7]))
        );
        assert_eq!(
            service.dispatch(Request::ReadHoldingRegisters(99, 1)),
            Err(ExceptionCode::IllegalDataAddress)
        );
    }

    #[test]
    fn test_unsupported_tables() {
        let service = service();
        assert_eq!(
            service.dispatch(Request::ReadDiscreteInputs(0, 1)),
            Err(ExceptionCode::IllegalFunction)
        );
        assert_eq!(
            service.dispatch(Request::ReadInputRegisters(0, 1)),
            Err(ExceptionCode::IllegalFunction)
        );
        assert_eq!(
            service.dispatch(Request::MaskWriteRegister(100, 0xff, 0)),
            Err(ExceptionCode::IllegalFunction)
        );
    }

    async fn serve(options: ServerOptions) -> ServerHandle {
        let handler = Arc::new(RequestHandler::new(4, 0, 4, 0).unwrap());
        spawn_tcp_server("127.0.0.1:0", handler, options, CancellationToken::new())
            .await
            .unwrap()
    }

    /// Outer `Ok`: answered in time. Inner `Ok`: transport healthy.
    async fn try_read(ctx: &mut client::Context) -> bool {
        matches!(
            tokio::time::timeout(Duration::from_secs(2), ctx.read_holding_registers(0, 1)).await,
            Ok(Ok(Ok(_)))
        )
    }

    #[tokio::test]
    async fn test_shutdown_closes_open_sessions() {
        let server = serve(ServerOptions::default()).await;
        let mut ctx = client::tcp::connect(server.local_addr()).await.unwrap();
        assert!(try_read(&mut ctx).await);

        server.shutdown().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!try_read(&mut ctx).await);
    }

    #[tokio::test]
    async fn test_clients_beyond_limit_are_refused() {
        let server = serve(ServerOptions {
            max_clients: 1,
            idle_timeout: None,
        })
        .await;
        let addr = server.local_addr();

        let mut first = client::tcp::connect(addr).await.unwrap();
        assert!(try_read(&mut first).await);

        let mut second = client::tcp::connect(addr).await.unwrap();
        assert!(!try_read(&mut second).await);

        // The slot frees once the first session ends
        drop(first);
        let mut admitted = false;
        for _ in 0..50 {
            let mut next = client::tcp::connect(addr).await.unwrap();
            if try_read(&mut next).await {
                admitted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(admitted);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_idle_clients_are_disconnected() {
        let server = serve(ServerOptions {
            max_clients: 0,
            idle_timeout: Some(Duration::from_millis(100)),
        })
        .await;

        let mut ctx = client::tcp::connect(server.local_addr()).await.unwrap();
        assert!(try_read(&mut ctx).await);
        // Activity keeps the session open
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(try_read(&mut ctx).await);
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!try_read(&mut ctx).await);

        server.shutdown().await;
    }
}
