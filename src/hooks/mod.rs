// src/hooks/mod.rs

//! User-supplied lifecycle callbacks (`spec.md` §4.9).

use crate::error::{Error, Result};
use crate::membership::ClusterMember;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// The wire payload of `POST /internal/hooks/{PreRemove|PostRemove}`: the
/// acting member plus the `force` flag threaded through from the original
/// `DELETE /internal/cluster/{name}?force=` request (`spec.md` §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookRemovalRequest {
    pub member: ClusterMember,
    #[serde(default)]
    pub force: bool,
}

/// Invoked on the node being removed, before it resets itself.
#[async_trait]
pub trait PreRemove: Send + Sync {
    async fn call(&self, member: &ClusterMember, force: bool) -> Result<()>;
}

/// Invoked on every surviving node after a removal completes.
#[async_trait]
pub trait PostRemove: Send + Sync {
    async fn call(&self, member: &ClusterMember, force: bool) -> Result<()>;
}

/// Invoked on every existing node after a join succeeds.
#[async_trait]
pub trait OnNewMember: Send + Sync {
    async fn call(&self, member: &ClusterMember) -> Result<()>;
}

/// Invoked on the leader after each successful heartbeat round.
#[async_trait]
pub trait OnHeartbeat: Send + Sync {
    async fn call(&self, members: &[ClusterMember]) -> Result<()>;
}

/// A no-op implementation of every hook, used when an embedder registers
/// none of its own.
pub struct NoopHooks;

#[async_trait]
impl PreRemove for NoopHooks {
    async fn call(&self, _member: &ClusterMember, _force: bool) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl PostRemove for NoopHooks {
    async fn call(&self, _member: &ClusterMember, _force: bool) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl OnNewMember for NoopHooks {
    async fn call(&self, _member: &ClusterMember) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl OnHeartbeat for NoopHooks {
    async fn call(&self, _members: &[ClusterMember]) -> Result<()> {
        Ok(())
    }
}

/// The set of hooks an embedder registers, wired into the daemon at
/// construction.
pub struct HookDispatcher {
    pre_remove: Box<dyn PreRemove>,
    post_remove: Box<dyn PostRemove>,
    on_new_member: Box<dyn OnNewMember>,
    on_heartbeat: Box<dyn OnHeartbeat>,
}

impl Default for HookDispatcher {
    fn default() -> Self {
        Self {
            pre_remove: Box::new(NoopHooks),
            post_remove: Box::new(NoopHooks),
            on_new_member: Box::new(NoopHooks),
            on_heartbeat: Box::new(NoopHooks),
        }
    }
}

impl HookDispatcher {
    pub fn new(
        pre_remove: Box<dyn PreRemove>,
        post_remove: Box<dyn PostRemove>,
        on_new_member: Box<dyn OnNewMember>,
        on_heartbeat: Box<dyn OnHeartbeat>,
    ) -> Self {
        Self {
            pre_remove,
            post_remove,
            on_new_member,
            on_heartbeat,
        }
    }

    /// Runs `PreRemove`. Under `force=true`, a failure is logged and
    /// swallowed; otherwise it propagates (`spec.md` §4.9).
    pub async fn pre_remove(&self, member: &ClusterMember, force: bool) -> Result<()> {
        match self.pre_remove.call(member, force).await {
            Ok(()) => Ok(()),
            Err(e) if force => {
                warn!(error = %e, member = %member.name, "PreRemove hook failed, continuing (force)");
                Ok(())
            }
            Err(e) => Err(Error::HookFailed(format!("PreRemove failed for {}: {e}", member.name))),
        }
    }

    pub async fn post_remove(&self, member: &ClusterMember, force: bool) {
        if let Err(e) = self.post_remove.call(member, force).await {
            warn!(error = %e, member = %member.name, "PostRemove hook failed");
        }
    }

    pub async fn on_new_member(&self, member: &ClusterMember) {
        if let Err(e) = self.on_new_member.call(member).await {
            warn!(error = %e, member = %member.name, "OnNewMember hook failed");
        }
    }

    pub async fn on_heartbeat(&self, members: &[ClusterMember]) {
        if let Err(e) = self.on_heartbeat.call(members).await {
            warn!(error = %e, "OnHeartbeat hook failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Role;
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn member(name: &str) -> ClusterMember {
        ClusterMember {
            name: name.into(),
            address: format!("{name}:7443"),
            certificate: "---cert---".into(),
            schema_version: 1,
            last_heartbeat: Utc::now(),
            role: Role::Voter,
            status: Default::default(),
        }
    }

    struct FailingPreRemove;

    #[async_trait]
    impl PreRemove for FailingPreRemove {
        async fn call(&self, _member: &ClusterMember, _force: bool) -> Result<()> {
            Err(Error::HookFailed("boom".into()))
        }
    }

    #[tokio::test]
    async fn pre_remove_propagates_failure_without_force() {
        let dispatcher = HookDispatcher::new(
            Box::new(FailingPreRemove),
            Box::new(NoopHooks),
            Box::new(NoopHooks),
            Box::new(NoopHooks),
        );
        assert!(dispatcher.pre_remove(&member("a"), false).await.is_err());
    }

    #[tokio::test]
    async fn pre_remove_swallows_failure_with_force() {
        let dispatcher = HookDispatcher::new(
            Box::new(FailingPreRemove),
            Box::new(NoopHooks),
            Box::new(NoopHooks),
            Box::new(NoopHooks),
        );
        assert!(dispatcher.pre_remove(&member("a"), true).await.is_ok());
    }

    struct CountingPostRemove(Arc<AtomicBool>);

    #[async_trait]
    impl PostRemove for CountingPostRemove {
        async fn call(&self, _member: &ClusterMember, _force: bool) -> Result<()> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn post_remove_runs_even_though_it_cannot_fail_the_caller() {
        let called = Arc::new(AtomicBool::new(false));
        let dispatcher = HookDispatcher::new(
            Box::new(NoopHooks),
            Box::new(CountingPostRemove(called.clone())),
            Box::new(NoopHooks),
            Box::new(NoopHooks),
        );
        dispatcher.post_remove(&member("a"), false).await;
        assert!(called.load(Ordering::SeqCst));
    }
}
