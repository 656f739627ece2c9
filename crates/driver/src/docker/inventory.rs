use bollard::models::ContainerSummary;

/// Basic container information derived from Docker's list API, used for
/// orphan-container GC's label-filtered scan.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub state: String,
    pub labels: std::collections::HashMap<String, String>,
}

impl From<ContainerSummary> for ContainerInfo {
    fn from(s: ContainerSummary) -> Self {
        Self {
            id: s.id.unwrap_or_default(),
            name: s
                .names
                .as_deref()
                .and_then(|n| n.first())
                .map(|n| n.trim_start_matches('/'))
                .unwrap_or("unknown")
                .to_string(),
            state: s.state.map(|s| s.to_string()).unwrap_or_else(|| "unknown".into()),
            labels: s.labels.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_leading_slash_from_name() {
        let summary = ContainerSummary {
            id: Some("abc".into()),
            names: Some(vec!["/bay-session-sess-1".into()]),
            ..Default::default()
        };
        let info = ContainerInfo::from(summary);
        assert_eq!(info.name, "bay-session-sess-1");
    }

    #[test]
    fn missing_name_falls_back_to_unknown() {
        let summary = ContainerSummary { id: Some("abc".into()), ..Default::default() };
        let info = ContainerInfo::from(summary);
        assert_eq!(info.name, "unknown");
    }
}
