use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::HostError;

/// Stable, process-independent name of one installable extension.
///
/// Flattened form is `package/component`. A component starting with `.` is
/// relative to the package, so `com.example/.Weather` names
/// `com.example/com.example.Weather`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExtensionIdentity {
    package: String,
    component: String,
}

impl ExtensionIdentity {
    pub fn new(package: impl Into<String>, component: impl Into<String>) -> Self {
        let package = package.into();
        let component = component.into();
        let component = if component.starts_with('.') {
            format!("{package}{component}")
        } else {
            component
        };
        Self { package, component }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn component(&self) -> &str {
        &self.component
    }
}

impl fmt::Display for ExtensionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.package, self.component)
    }
}

impl FromStr for ExtensionIdentity {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let Some((package, component)) = s.split_once('/') else {
            return Err(HostError::InvalidIdentity(s.to_string()));
        };
        if package.is_empty() || component.is_empty() || component.contains('/') {
            return Err(HostError::InvalidIdentity(s.to_string()));
        }
        Ok(Self::new(package, component))
    }
}

impl TryFrom<String> for ExtensionIdentity {
    type Error = HostError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ExtensionIdentity> for String {
    fn from(value: ExtensionIdentity) -> Self {
        value.to_string()
    }
}
