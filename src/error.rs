use std::fmt;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Config(String),
    Calibration(&'static str),
    InternerFull,
    RingClosed,
    Layout(String),
    Corrupt(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::Config(msg) => write!(f, "config error: {msg}"),
            Error::Calibration(msg) => write!(f, "clock calibration failed: {msg}"),
            Error::InternerFull => write!(f, "interner token space exhausted"),
            Error::RingClosed => write!(f, "ring closed"),
            Error::Layout(msg) => write!(f, "invalid layout: {msg}"),
            Error::Corrupt(msg) => write!(f, "corrupt data: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
