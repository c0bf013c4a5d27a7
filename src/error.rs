use thiserror::Error;

#[derive(Error, Debug)]
pub enum UhalError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid context: {0:#x}")]
    InvalidContext(u64),

    #[error("Invalid device: {0:#x}")]
    InvalidDevice(u64),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Out of host memory")]
    OutOfHostMemory,

    #[error("Out of device memory")]
    OutOfDeviceMemory,

    #[error("Device error: {0}")]
    Device(String),
}

// A convenient alias
pub type UhalResult<T> = Result<T, UhalError>;
