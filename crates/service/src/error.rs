use std::fmt;

#[derive(Debug, PartialEq, Eq)]
pub enum RegisterError {
    AddressInUse,
}

impl std::error::Error for RegisterError {}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddressInUse => write!(f, "address already has an active session"),
        }
    }
}
