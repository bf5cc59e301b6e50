use std::convert::Infallible;
use std::future::{self, Future};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};

use crate::config::RouterConfig;
use crate::http::{self, Request, Response};
use crate::router::Router;

/// Minimum HTTP/1 read buffer hyper accepts.
const MIN_BUF_SIZE: usize = 8192;

/// Hosts a [`Router`] on hyper.
///
/// ```no_run
/// use switchyard::{Application, Router, RouterConfig, Server};
/// # use switchyard::{RequestWrapper, Response, RouterResult, ViewRenderer};
/// # struct Renderer;
/// # impl ViewRenderer for Renderer {
/// #     fn render(
/// #         &self,
/// #         _: &str,
/// #         _: &RequestWrapper,
/// #         _: hyper::StatusCode,
/// #         _: bool,
/// #     ) -> RouterResult<Response> {
/// #         Ok(Response::new("".into()))
/// #     }
/// # }
///
/// #[tokio::main]
/// async fn main() -> std::io::Result<()> {
///     let config = RouterConfig::new().expect("invalid configuration");
///     let app = Application::builder(Renderer)
///         .build(&config)
///         .expect("invalid routes");
///     let router = Router::from_config(app, &config);
///
///     Server::from_config(config)?.serve(router).await
/// }
/// ```
#[derive(Debug)]
pub struct Server {
    addr: SocketAddr,
    config: RouterConfig,
}

impl Server {
    /// A server on `addr` with default connection settings.
    pub fn bind(addr: SocketAddr) -> Self {
        Self {
            addr,
            config: RouterConfig::default(),
        }
    }

    /// A server on the configured `host:port`.
    pub fn from_config(config: RouterConfig) -> io::Result<Self> {
        Ok(Self {
            addr: config.socket_addr()?,
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves until the process ends.
    pub async fn serve(self, router: Router) -> io::Result<()> {
        self.serve_with_shutdown(router, future::pending()).await
    }

    /// Serves until `signal` resolves, then drains open connections.
    pub async fn serve_with_shutdown<F>(self, router: Router, signal: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let router = Arc::new(router);
        let trust_forwarded = self.config.trust_forwarded_proto;
        let body_limit = self.config.max_body_size;

        let make_service = make_service_fn(move |conn: &AddrStream| {
            let router = Arc::clone(&router);
            let peer = conn.remote_addr();
            async move {
                Ok::<_, Infallible>(service_fn(move |request: Request| {
                    let router = Arc::clone(&router);
                    async move {
                        let response =
                            handle(&router, request, peer, trust_forwarded, body_limit).await;
                        Ok::<_, Infallible>(response)
                    }
                }))
            }
        });

        let builder = hyper::Server::try_bind(&self.addr).map_err(io_error)?;
        let builder = configure(builder, &self.config);

        log::info!("listening on {}", self.addr);
        builder
            .serve(make_service)
            .with_graceful_shutdown(signal)
            .await
            .map_err(io_error)
    }
}

async fn handle(
    router: &Router,
    request: Request,
    peer: SocketAddr,
    trust_forwarded: bool,
    body_limit: usize,
) -> Response {
    let secure = trust_forwarded && http::forwarded_secure(request.headers());
    log::trace!("{} {} from {}", request.method(), request.uri(), peer);

    match http::buffer(request, secure, body_limit).await {
        Ok(incoming) => router.dispatch(incoming).await,
        Err(err) => {
            log::debug!("{}", err);
            http::status(err.status())
        }
    }
}

fn configure(
    builder: hyper::server::Builder<hyper::server::conn::AddrIncoming>,
    config: &RouterConfig,
) -> hyper::server::Builder<hyper::server::conn::AddrIncoming> {
    let max_buf_size = if config.http1_max_buf_size < MIN_BUF_SIZE {
        log::warn!(
            "http1_max_buf_size {} below minimum, using {}",
            config.http1_max_buf_size,
            MIN_BUF_SIZE
        );
        MIN_BUF_SIZE
    } else {
        config.http1_max_buf_size
    };

    let builder = builder
        .http1_keepalive(config.http1_keep_alive)
        .http1_half_close(config.http1_half_close)
        .http1_max_buf_size(max_buf_size)
        .http1_pipeline_flush(config.http1_pipeline_flush)
        .http1_writev(config.http1_writev)
        .http1_title_case_headers(config.http1_title_case_headers)
        .http1_preserve_header_case(config.http1_preserve_header_case)
        .http1_only(config.http1_only);

    #[cfg(feature = "http2")]
    let builder = builder
        .http2_only(config.http2_only)
        .http2_initial_stream_window_size(config.http2_initial_stream_window_size)
        .http2_initial_connection_window_size(config.http2_initial_connection_window_size)
        .http2_adaptive_window(config.http2_adaptive_window)
        .http2_max_frame_size(config.http2_max_frame_size)
        .http2_max_concurrent_streams(config.http2_max_concurrent_streams)
        .http2_max_send_buf_size(config.http2_max_send_buf_size);

    builder
}

fn io_error(err: hyper::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::Application;
    use crate::route::{RouteBuilder, SecurityMode};
    use crate::testing::{config, EchoRenderer};
    use hyper::header::LOCATION;
    use hyper::{Body, Client, StatusCode};
    use std::net::TcpListener;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_serves_and_honours_forwarded_proto() {
        let mut config = config();
        config.port = free_port();
        config.max_body_size = 16;
        let app = Application::builder(EchoRenderer)
            .route(RouteBuilder::new("/admin", "admin").security(SecurityMode::ForceTls))
            .build(&config)
            .unwrap();
        let router = Router::from_config(app, &config);
        let server = Server::from_config(config).unwrap();
        let addr = server.local_addr();

        let (stop, stopped) = oneshot::channel::<()>();
        let serving = tokio::spawn(server.serve_with_shutdown(router, async {
            stopped.await.ok();
        }));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let client = Client::new();
        let plain = client
            .get(format!("http://{}/admin", addr).parse().unwrap())
            .await
            .unwrap();
        assert_eq!(plain.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(plain.headers()[LOCATION], "https://127.0.0.1/admin");

        let forwarded = hyper::Request::get(format!("http://{}/admin", addr))
            .header(http::X_FORWARDED_PROTO, "https")
            .body(Body::empty())
            .unwrap();
        let response = client.request(forwarded).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let missing = client
            .get(format!("http://{}/nowhere", addr).parse().unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let oversized = hyper::Request::post(format!("http://{}/admin", addr))
            .body(Body::from(vec![b'x'; 64]))
            .unwrap();
        let response = client.request(oversized).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        drop(client);
        stop.send(()).unwrap();
        serving.await.unwrap().unwrap();
    }

    #[test]
    fn test_bind_uses_default_settings() {
        let server = Server::bind("127.0.0.1:4000".parse().unwrap());
        assert_eq!(server.local_addr().port(), 4000);
        assert!(server.config.trust_forwarded_proto);
    }
}
