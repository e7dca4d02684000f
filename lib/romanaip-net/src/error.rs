use thiserror::Error;

pub type Result<T> = std::result::Result<T, NetError>;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("no default route found in the main routing table")]
    NoDefaultRoute,

    #[error("no link found for interface index {0}")]
    LinkNotFound(u32),

    #[error("no IPv4 addresses bound to link {0}")]
    NoAddressesBound(String),

    #[error("malformed romanaIP record: {0}")]
    MalformedRecord(String),

    #[error("incomplete romanaIP record: missing {0}")]
    IncompleteRecord(&'static str),

    #[error("error parsing romanaIP address: {0}")]
    AddressParse(String),

    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to flush route table {table}: {output}")]
    FlushFailed { table: String, output: String },
}
