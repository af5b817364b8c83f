use crate::error::ErrorCategory;

/// Built-in exception types visible to scripts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExcKind {
    Exception,
    ArithmeticError,
    ZeroDivisionError,
    OverflowError,
    LookupError,
    KeyError,
    IndexError,
    ValueError,
    TypeError,
    NameError,
    AttributeError,
    ImportError,
    AssertionError,
    RuntimeError,
    RecursionError,
    MemoryError,
    TimeoutError,
    ConnectionError,
    NetworkDestinationRejected,
}

impl ExcKind {
    pub const ALL: [ExcKind; 19] = [
        Self::Exception,
        Self::ArithmeticError,
        Self::ZeroDivisionError,
        Self::OverflowError,
        Self::LookupError,
        Self::KeyError,
        Self::IndexError,
        Self::ValueError,
        Self::TypeError,
        Self::NameError,
        Self::AttributeError,
        Self::ImportError,
        Self::AssertionError,
        Self::RuntimeError,
        Self::RecursionError,
        Self::MemoryError,
        Self::TimeoutError,
        Self::ConnectionError,
        Self::NetworkDestinationRejected,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Exception => "Exception",
            Self::ArithmeticError => "ArithmeticError",
            Self::ZeroDivisionError => "ZeroDivisionError",
            Self::OverflowError => "OverflowError",
            Self::LookupError => "LookupError",
            Self::KeyError => "KeyError",
            Self::IndexError => "IndexError",
            Self::ValueError => "ValueError",
            Self::TypeError => "TypeError",
            Self::NameError => "NameError",
            Self::AttributeError => "AttributeError",
            Self::ImportError => "ImportError",
            Self::AssertionError => "AssertionError",
            Self::RuntimeError => "RuntimeError",
            Self::RecursionError => "RecursionError",
            Self::MemoryError => "MemoryError",
            Self::TimeoutError => "TimeoutError",
            Self::ConnectionError => "ConnectionError",
            Self::NetworkDestinationRejected => "NetworkDestinationRejected",
        }
    }

    pub fn lookup(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    pub fn parent(&self) -> Option<Self> {
        match self {
            Self::Exception => None,
            Self::ZeroDivisionError | Self::OverflowError => Some(Self::ArithmeticError),
            Self::KeyError | Self::IndexError => Some(Self::LookupError),
            Self::RecursionError => Some(Self::RuntimeError),
            Self::NetworkDestinationRejected => Some(Self::ConnectionError),
            _ => Some(Self::Exception),
        }
    }

    /// True if `self` is `other` or derives from it.
    pub fn is_a(&self, other: ExcKind) -> bool {
        let mut current = Some(*self);
        while let Some(kind) = current {
            if kind == other {
                return true;
            }
            current = kind.parent();
        }
        false
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ArithmeticError | Self::ZeroDivisionError | Self::OverflowError => {
                ErrorCategory::Arithmetic
            }
            Self::LookupError | Self::KeyError | Self::IndexError => ErrorCategory::Lookup,
            Self::ValueError => ErrorCategory::Value,
            Self::TypeError => ErrorCategory::Type,
            Self::NameError => ErrorCategory::Name,
            Self::AttributeError => ErrorCategory::Attribute,
            Self::ImportError => ErrorCategory::Import,
            Self::AssertionError => ErrorCategory::Assertion,
            Self::RuntimeError | Self::RecursionError => ErrorCategory::Runtime,
            Self::MemoryError => ErrorCategory::Resource,
            Self::TimeoutError => ErrorCategory::Timeout,
            Self::ConnectionError | Self::NetworkDestinationRejected => ErrorCategory::Network,
            Self::Exception => ErrorCategory::Generic,
        }
    }

    /// Whether the message can be returned to the caller verbatim. Connection
    /// failures carry resolver and socket detail and are generalized.
    pub fn is_message_safe(&self) -> bool {
        !matches!(self, Self::ConnectionError)
    }
}

/// A raised script exception
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exception {
    pub kind: ExcKind,
    pub message: String,
}

impl Exception {
    pub fn new(kind: ExcKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ExcKind::TypeError, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(ExcKind::ValueError, message)
    }

    pub fn index_error(message: impl Into<String>) -> Self {
        Self::new(ExcKind::IndexError, message)
    }

    pub fn key_error(message: impl Into<String>) -> Self {
        Self::new(ExcKind::KeyError, message)
    }

    pub fn attribute_error(message: impl Into<String>) -> Self {
        Self::new(ExcKind::AttributeError, message)
    }

    pub fn overflow() -> Self {
        Self::new(ExcKind::OverflowError, "integer overflow")
    }

    pub fn zero_division(message: impl Into<String>) -> Self {
        Self::new(ExcKind::ZeroDivisionError, message)
    }

    pub fn memory(message: impl Into<String>) -> Self {
        Self::new(ExcKind::MemoryError, message)
    }
}

impl std::fmt::Display for Exception {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind.name())
        } else {
            write!(f, "{}: {}", self.kind.name(), self.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hierarchy() {
        assert!(ExcKind::ZeroDivisionError.is_a(ExcKind::ArithmeticError));
        assert!(ExcKind::ZeroDivisionError.is_a(ExcKind::Exception));
        assert!(ExcKind::KeyError.is_a(ExcKind::LookupError));
        assert!(!ExcKind::KeyError.is_a(ExcKind::ValueError));
        assert!(ExcKind::NetworkDestinationRejected.is_a(ExcKind::ConnectionError));
    }

    #[test]
    fn lookup_round_trips_names() {
        for kind in ExcKind::ALL {
            assert_eq!(ExcKind::lookup(kind.name()), Some(kind));
        }
        assert_eq!(ExcKind::lookup("SystemExit"), None);
    }

    #[test]
    fn categories_and_message_safety() {
        assert_eq!(ExcKind::ZeroDivisionError.category(), ErrorCategory::Arithmetic);
        assert_eq!(ExcKind::IndexError.category(), ErrorCategory::Lookup);
        assert!(!ExcKind::ConnectionError.is_message_safe());
        assert!(ExcKind::NetworkDestinationRejected.is_message_safe());
    }
}
