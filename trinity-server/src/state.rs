//! Shared application state
//!
//! Built once at startup and cloned into every handler. No module-level
//! singletons: tests construct this with the in-memory backend and the
//! fake driver/transport.

use std::sync::Arc;

use trinity_runtime::{
    ActivityService, CredentialService, ExecutionQueue, LifecycleManager, PermissionResolver,
    Scheduler,
};
use trinity_store::StateStore;

use crate::auth::JwtKeys;

#[derive(Clone)]
pub struct AppState {
    pub store: StateStore,
    pub queue: ExecutionQueue,
    pub lifecycle: Arc<LifecycleManager>,
    pub scheduler: Arc<Scheduler>,
    pub resolver: PermissionResolver,
    pub activity: ActivityService,
    pub credentials: Arc<CredentialService>,
    pub jwt: JwtKeys,
}
