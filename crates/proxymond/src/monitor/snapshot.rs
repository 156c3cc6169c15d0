use super::store::ProxySettings;

/// Last reading journalled by one watch-loop activation.
#[derive(Debug, Default)]
pub(crate) struct ProxySnapshot {
    last: Option<ProxySettings>,
}

impl ProxySnapshot {
    /// Records `reading` and reports whether it must be journalled, which is
    /// the case on the first observation or when it differs from the last one.
    pub(crate) fn observe(&mut self, reading: &ProxySettings) -> bool {
        if self.last.as_ref() == Some(reading) {
            return false;
        }
        self.last = Some(reading.clone());
        true
    }

    pub(crate) const fn has_observed(&self) -> bool {
        self.last.is_some()
    }
}
