//! A single explicit HTTP(S) connection.
//!
//! Unlike a pooled client, this models the archive protocol's connection
//! lifecycle directly: `open` establishes one TCP (optionally TLS)
//! connection and performs the HTTP/1.1 handshake, `close` drops it, and
//! a failed request leaves the connection closed until the caller
//! reopens it. Must be used from within a tokio runtime; the connection
//! driver task is spawned onto the ambient runtime.

use anyhow::{bail, format_err, Error};
use hyper::body::HttpBody;
use hyper::client::conn::{self, SendRequest};
use hyper::{Body, Request, Response};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

pub struct HttpConnection {
    hostname: String,
    port: u16,
    use_tls: bool,
    sender: Option<SendRequest<Body>>,
}

impl HttpConnection {
    pub fn new(hostname: String, use_tls: bool) -> Self {
        let port = if use_tls { 443 } else { 80 };
        Self {
            hostname,
            port,
            use_tls,
            sender: None,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn is_secure(&self) -> bool {
        self.use_tls
    }

    pub fn is_open(&self) -> bool {
        self.sender.is_some()
    }

    /// Establish the connection and perform the HTTP handshake. A
    /// previously open connection is dropped first.
    pub async fn open(&mut self) -> Result<(), Error> {
        self.sender = None;

        let stream = TcpStream::connect((self.hostname.as_str(), self.port))
            .await
            .map_err(|err| {
                format_err!("unable to connect to {}:{} - {}", self.hostname, self.port, err)
            })?;

        if self.use_tls {
            let connector =
                openssl::ssl::SslConnector::builder(openssl::ssl::SslMethod::tls_client())?
                    .build();
            let ssl = connector
                .configure()?
                .into_ssl(&self.hostname)
                .map_err(|err| format_err!("tls configuration failed - {}", err))?;
            let mut tls_stream = tokio_openssl::SslStream::new(ssl, stream)?;
            std::pin::Pin::new(&mut tls_stream)
                .connect()
                .await
                .map_err(|err| {
                    format_err!("tls handshake with {} failed - {}", self.hostname, err)
                })?;
            self.handshake(tls_stream).await
        } else {
            self.handshake(stream).await
        }
    }

    async fn handshake<S>(&mut self, stream: S) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, connection) = conn::handshake(stream).await?;
        let hostname = self.hostname.clone();
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                log::debug!("connection to {} terminated - {}", hostname, err);
            }
        });
        self.sender = Some(sender);
        Ok(())
    }

    /// Drop the connection.
    pub fn close(&mut self) {
        self.sender = None;
    }

    /// Send one request and collect the full response body. Any error
    /// closes the connection.
    pub async fn send_request(
        &mut self,
        request: Request<Body>,
    ) -> Result<(Response<Body>, Vec<u8>), Error> {
        let sender = match self.sender.as_mut() {
            Some(sender) => sender,
            None => bail!("connection to {} is not open", self.hostname),
        };

        let result = async {
            futures::future::poll_fn(|cx| sender.poll_ready(cx)).await?;
            let response = sender.send_request(request).await?;
            Ok::<_, hyper::Error>(response)
        }
        .await;

        let mut response = match result {
            Ok(response) => response,
            Err(err) => {
                self.sender = None;
                bail!("request to {} failed - {}", self.hostname, err);
            }
        };

        let mut payload = Vec::new();
        while let Some(chunk) = response.body_mut().data().await {
            match chunk {
                Ok(chunk) => payload.extend_from_slice(&chunk),
                Err(err) => {
                    self.sender = None;
                    bail!("response body from {} failed - {}", self.hostname, err);
                }
            }
        }

        Ok((response, payload))
    }
}
