//! # iotwire
//!
//! A lightweight, TCP-oriented binary request/response protocol engine for
//! IoT-class devices: heavier than raw sockets, far lighter than HTTP/1.1,
//! and request/response-native where MQTT is publish/subscribe.
//!
//! ## Wire format
//!
//! Frames start at two bytes and grow only with what they carry:
//!
//! ```text
//! MSCB LSCB [ID:2BE] [PATH, ETX] [HDR_COUNT:1] {key, RS, value, ETX}×n [BODY_LEN:1|2|4 BE] [BODY]
//! ```
//!
//! Body capacity scales with the method: SIGNAL up to 255 bytes, REQUEST
//! and RESPONSE up to ~64 KiB, STREAMING up to ~4 GiB. Bodies larger than
//! the negotiated buffer size (default 1024 bytes, renegotiable in-band)
//! are fragmented, each fragment re-carrying the prefix, and reassembled on
//! the far side.
//!
//! ## What the crate owns
//!
//! The per-connection protocol engine: the frame codec, multipart
//! reassembly with inactivity timeouts, the in-flight request/response
//! table, the keep-alive sub-protocol, buffer-size negotiation, write
//! serialization, and middleware dispatch. Transports are the host's
//! concern — [`Engine::listen`] accepts any `AsyncRead + AsyncWrite` byte
//! stream.
//!
//! ## Example
//!
//! ```ignore
//! use iotwire::{Engine, Method, Request, ResponseDescriptor};
//!
//! #[tokio::main]
//! async fn main() -> iotwire::Result<()> {
//!     let engine = Engine::new();
//!     engine.use_middleware(|req, conn, next| async move {
//!         match req.path() {
//!             Some("/echo") => {
//!                 let _ = conn.response(req.reply().with_body(req.body.clone())).await;
//!             }
//!             _ => next.run(req, conn).await,
//!         }
//!     });
//!
//!     let stream = tokio::net::TcpStream::connect("device:5530").await?;
//!     let peer = stream.peer_addr()?;
//!     let conn = engine.listen(stream, peer);
//!
//!     let descriptor = ResponseDescriptor::new()
//!         .on_response(|resp| async move { println!("{} bytes", resp.body.len()) });
//!     conn.request(
//!         Request::new(Method::Request).with_path("/echo").with_body(b"hi".as_ref()),
//!         Some(descriptor),
//!     )
//!     .await?;
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod error;
pub mod middleware;
pub mod protocol;

mod engine;
mod writer;

pub use connection::{Connection, ConnectionRegistry, ResponseDescriptor};
pub use engine::{Config, Engine};
pub use error::{IotError, Result};
pub use middleware::{BoxFuture, Middleware, Next};
pub use protocol::{
    Method, Request, DEFAULT_ALIVE_INTERVAL, DEFAULT_BUFFER_SIZE, DEFAULT_RESPONSE_TIMEOUT,
    IOT_ETX, IOT_LSCB_BODY, IOT_LSCB_HEADER, IOT_MSCB_ID, IOT_MSCB_PATH, IOT_RS, IOT_VERSION,
    MULTIPART_TIMEOUT,
};
