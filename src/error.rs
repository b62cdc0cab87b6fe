use std::fmt;

/// Several independent failures reported as one error.
///
/// With a single error the message is that error's, otherwise the messages are listed as
/// `[first, second, ...]`.  Each message includes its context chain.
#[derive(Debug, Default)]
pub struct AggregateError {
    errors: Vec<anyhow::Error>,
}

impl AggregateError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: impl Into<anyhow::Error>) {
        self.errors.push(error.into());
    }

    pub fn append(&mut self, other: AggregateError) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// `Ok(())` if nothing was collected.
    pub fn into_result(self) -> Result<(), AggregateError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl FromIterator<anyhow::Error> for AggregateError {
    fn from_iter<T: IntoIterator<Item = anyhow::Error>>(iter: T) -> Self {
        AggregateError {
            errors: iter.into_iter().collect(),
        }
    }
}

impl Extend<anyhow::Error> for AggregateError {
    fn extend<T: IntoIterator<Item = anyhow::Error>>(&mut self, iter: T) {
        self.errors.extend(iter);
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.as_slice() {
            [] => Ok(()),
            [only] => write!(f, "{only:#}"),
            errors => {
                f.write_str("[")?;
                for (i, error) in errors.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{error:#}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl std::error::Error for AggregateError {}
