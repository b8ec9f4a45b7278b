use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("interface {ifindex} not found")]
    InterfaceNotFound { ifindex: u32 },

    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    #[error("neighbor table full ({capacity} entries)")]
    TableFull { capacity: usize },

    #[error("egress error: {0}")]
    Egress(String),
}

pub type Result<T> = std::result::Result<T, Error>;
