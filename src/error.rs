use std::io;

#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "IO error: {}", _0)]
    IO(io::Error),
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::IO(error)
    }
}

impl Error {
    /// The errno carried by this error, if any. Hooked syscalls use it to
    /// keep libc error reporting conventions before returning -1.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Error::IO(e) => e.raw_os_error(),
        }
    }
}
