//! Hooks run around transmission and response dispatch.
//!
//! A [`HookSet`] may have a parent. Unset hooks fall back to the parent's,
//! which is how connections accepted by a server inherit the server's
//! hooks and error policy unless overridden per connection.

use std::sync::{Arc, RwLock};

use super::{read, write};
use crate::{config::ErrorPolicy, envelope::Envelope};

/// Runs on every outgoing envelope after error normalization.
pub type TransmitHook = Arc<dyn Fn(&mut Envelope) + Send + Sync>;
/// Observes an envelope without changing it.
pub type ObserveHook = Arc<dyn Fn(&Envelope) + Send + Sync>;

#[derive(Default)]
pub struct HookSet {
    error_policy: RwLock<Option<ErrorPolicy>>,
    before_transmit: RwLock<Option<TransmitHook>>,
    after_transmit: RwLock<Option<ObserveHook>>,
    on_response: RwLock<Option<ObserveHook>>,
    parent: Option<Arc<HookSet>>,
}

impl HookSet {
    /// Hook set that defers to `parent` for anything left unset.
    #[must_use]
    pub fn with_parent(parent: Arc<HookSet>) -> Self {
        Self {
            parent: Some(parent),
            ..Self::default()
        }
    }

    pub fn set_error_policy(&self, policy: Option<ErrorPolicy>) {
        *write(&self.error_policy) = policy;
    }

    pub fn set_before_transmit(&self, hook: Option<TransmitHook>) {
        *write(&self.before_transmit) = hook;
    }

    pub fn set_after_transmit(&self, hook: Option<ObserveHook>) {
        *write(&self.after_transmit) = hook;
    }

    pub fn set_on_response(&self, hook: Option<ObserveHook>) { *write(&self.on_response) = hook; }

    /// Effective error policy, falling back through parents to
    /// [`ErrorPolicy::All`].
    #[must_use]
    pub fn error_policy(&self) -> ErrorPolicy {
        if let Some(policy) = read(&self.error_policy).clone() {
            return policy;
        }
        self.parent
            .as_ref()
            .map_or(ErrorPolicy::All, |p| p.error_policy())
    }

    pub(crate) fn before_transmit(&self) -> Option<TransmitHook> {
        read(&self.before_transmit)
            .clone()
            .or_else(|| self.parent.as_ref().and_then(|p| p.before_transmit()))
    }

    pub(crate) fn after_transmit(&self) -> Option<ObserveHook> {
        read(&self.after_transmit)
            .clone()
            .or_else(|| self.parent.as_ref().and_then(|p| p.after_transmit()))
    }

    pub(crate) fn on_response(&self) -> Option<ObserveHook> {
        read(&self.on_response)
            .clone()
            .or_else(|| self.parent.as_ref().and_then(|p| p.on_response()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_inherits_until_overridden() {
        let parent = Arc::new(HookSet::default());
        parent.set_error_policy(Some(ErrorPolicy::Code));
        let child = HookSet::with_parent(Arc::clone(&parent));
        assert!(matches!(child.error_policy(), ErrorPolicy::Code));
        child.set_error_policy(Some(ErrorPolicy::None));
        assert!(matches!(child.error_policy(), ErrorPolicy::None));
        assert!(matches!(parent.error_policy(), ErrorPolicy::Code));
    }

    #[test]
    fn hooks_fall_back_to_parent() {
        let parent = Arc::new(HookSet::default());
        parent.set_before_transmit(Some(Arc::new(|env: &mut Envelope| {
            env.target = Some("stamped".into());
        })));
        let child = HookSet::with_parent(parent);
        let hook = child.before_transmit().expect("inherited hook");
        let mut env = Envelope::default();
        hook(&mut env);
        assert_eq!(env.target.as_deref(), Some("stamped"));
        assert!(child.on_response().is_none());
    }
}
