/// Identity of the locally connected node
///
/// The id is learned either from the transport (authoritative, when the radio reports it)
/// or inferred from the first directed text message heard. Whichever comes first wins;
/// the value never changes afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalIdentity {
    node_id: Option<String>,
}

impl LocalIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    pub fn is_known(&self) -> bool {
        self.node_id.is_some()
    }

    pub fn is_me(&self, node_id: &str) -> bool {
        self.node_id.as_deref() == Some(node_id)
    }

    /// Set the id if it is still unknown. Returns `true` only for the call that set it.
    pub fn set_once(&mut self, node_id: &str) -> bool {
        if self.node_id.is_some() || node_id.trim().is_empty() {
            return false;
        }
        self.node_id = Some(node_id.to_string());
        true
    }
}
