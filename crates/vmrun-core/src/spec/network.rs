/// The single networking mode selected for this run, after the Network
/// Selector's validation pass (engine crate) has resolved CLI flags down to
/// exactly one variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkPlan {
    SharedNat,
    Bridged(Vec<String>),
    IsolatedFilter(Vec<String>),
    HostOnly(Vec<String>),
}

impl NetworkPlan {
    pub fn needs_filter_helper(&self) -> bool {
        matches!(self, Self::IsolatedFilter(_) | Self::HostOnly(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_filter_and_host_only_need_the_helper_subprocess() {
        assert!(!NetworkPlan::SharedNat.needs_filter_helper());
        assert!(!NetworkPlan::Bridged(vec!["en0".into()]).needs_filter_helper());
        assert!(NetworkPlan::IsolatedFilter(vec![]).needs_filter_helper());
        assert!(NetworkPlan::HostOnly(vec![]).needs_filter_helper());
    }
}
