#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeSelection {
    pub size: String,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SizeSelector {
    supported: Vec<String>,
    default_size: String,
}

impl SizeSelector {
    pub fn new(supported: &[String], default_size: &str) -> Self {
        Self {
            supported: supported.to_vec(),
            default_size: default_size.to_string(),
        }
    }

    pub fn supported(&self) -> &[String] {
        &self.supported
    }

    /// Never fails: an unsupported size falls back to the default with a reason.
    pub fn select(&self, requested: Option<&str>) -> SizeSelection {
        let Some(requested_value) = requested.map(str::trim).filter(|value| !value.is_empty())
        else {
            return SizeSelection {
                size: self.default_size.clone(),
                requested: None,
                fallback_reason: None,
            };
        };
        if self.supported.iter().any(|size| size == requested_value) {
            return SizeSelection {
                size: requested_value.to_string(),
                requested: Some(requested_value.to_string()),
                fallback_reason: None,
            };
        }
        SizeSelection {
            size: self.default_size.clone(),
            requested: Some(requested_value.to_string()),
            fallback_reason: Some(format!(
                "Unsupported image size '{requested_value}'; using default '{}'.",
                self.default_size
            )),
        }
    }
}
