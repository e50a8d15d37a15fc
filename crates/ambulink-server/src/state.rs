use std::sync::Arc;

use tokio::sync::Mutex;

use ambulink_store::Database;

use crate::acl::AclAuthorizer;
use crate::gateway::PublishGateway;
use crate::permissions::PermissionCache;

/// The single store connection. Every mutation holds the lock for the
/// length of one transaction.
pub type SharedDb = Arc<Mutex<Database>>;

/// Handles shared by the topic router and the HTTP surface.
#[derive(Clone)]
pub struct Bridge {
    pub db: SharedDb,
    pub cache: Arc<PermissionCache>,
    pub gateway: PublishGateway,
}

impl Bridge {
    pub fn new(db: Database, gateway: PublishGateway) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            cache: Arc::new(PermissionCache::new()),
            gateway,
        }
    }

    pub fn authorizer(&self) -> AclAuthorizer {
        AclAuthorizer::new(self.cache.clone(), self.db.clone())
    }
}
