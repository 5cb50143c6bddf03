//! Proxy-side dialing: the [`ProxyDialer`] contract and its SOCKS5 implementation.

mod socks5;
mod traits;

pub use socks5::{
    build_connect_request, handshake, read_connect_reply, reply_message, Socks5Config,
    Socks5Dialer, Socks5Error,
};
pub use traits::{DatagramConn, ProxyDialer, ProxyIo, ProxyStream, UdpDatagramConn};
