use std::{error::Error, fmt};

use mheap::error::Location;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(whatever, display("{message}"))]
pub struct GenericError {
    message: String,
    #[snafu(implicit)]
    location: Location,
    #[snafu(source(from(Box<dyn Error>, Some)))]
    source: Option<Box<dyn Error>>,
}

impl GenericError {
    pub fn location(&self) -> Location {
        self.location
    }
}

/// Prints an error followed by its chain of causes.
pub struct Report<E> {
    error: E,
}

impl<E> Report<E> {
    pub fn new(error: E) -> Self {
        Self { error }
    }
}

impl<E> fmt::Debug for Report<E>
where
    E: Error + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<E> fmt::Display for Report<E>
where
    E: Error + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Error: {}", Red(&self.error))?;
        if let Some(loc) = location(&self.error) {
            writeln!(f, "  at {}", Gray(loc))?;
        }
        let mut source = self.error.source();
        if source.is_some() {
            writeln!(f)?;
            writeln!(f, "Caused by:")?;
        }
        let mut index = 0;
        while let Some(s) = source {
            writeln!(f, "{index:4}: {}", Red(s))?;
            if let Some(loc) = location(s) {
                writeln!(f, "      at {}", Gray(loc))?;
            }
            source = s.source();
            index += 1;
        }
        Ok(())
    }
}

fn location(error: &(dyn Error + 'static)) -> Option<Location> {
    error.downcast_ref::<GenericError>().map(GenericError::location)
}

struct Red<T>(T);

impl<T> fmt::Display for Red<T>
where
    T: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\x1B[31m{}\x1B[0m", self.0)
    }
}

struct Gray<T>(T);

impl<T> fmt::Display for Gray<T>
where
    T: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\x1B[90m{}\x1B[0m", self.0)
    }
}
