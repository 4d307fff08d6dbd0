use serde::{Deserialize, Serialize};

/// An application host as known to the directory service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppHost {
    pub addr: String,
    pub app_name: String,
}

impl AppHost {
    pub fn new(addr: impl Into<String>, app_name: impl Into<String>) -> AppHost {
        AppHost {
            addr: addr.into(),
            app_name: app_name.into(),
        }
    }
}
