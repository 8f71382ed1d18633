//! Production [`Connector`]: opens a fresh TCP connection per reconnect
//! attempt and logs in with a fixed username/secret.

use tokio::net::TcpStream;

use crate::client::{BoxTransport, ConnectFuture, Connector};
use crate::proto::Fields;

#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: String,
}

impl Connector for TcpConnector {
    fn connect(&self) -> ConnectFuture {
        let addr = format!("{}:{}", self.host, self.port);
        Box::pin(async move {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true).ok();
            Ok(Box::new(stream) as BoxTransport)
        })
    }

    fn login_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.push("Username", &self.username);
        fields.push("Secret", &self.secret);
        fields
    }
}
