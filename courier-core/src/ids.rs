use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Declares a string-backed identifier newtype.
///
/// Every id gets a uuid v4 generator, `Display`, and conversions from
/// `String`/`&str` so repositories can hand back whatever their storage uses.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a new unique id
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

define_id!(
    /// One step of one workflow execution
    JobId
);
define_id!(
    /// One workflow execution instance
    NotificationId
);
define_id!(EnvironmentId);
define_id!(OrganizationId);
define_id!(
    /// Internal subscriber id (not the customer supplied external id)
    SubscriberId
);
define_id!(
    /// Workflow template id
    TemplateId
);
define_id!(
    /// Correlates every job produced by a single trigger
    TransactionId
);
define_id!(ExecutionDetailId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(JobId::new(), JobId::new());
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = NotificationId::from("n-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"n-1\"");
        assert_eq!(id.to_string(), "n-1");
    }
}
