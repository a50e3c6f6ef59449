//! The backend root: every long-lived collaborator, constructed once in
//! `main` and threaded through the connection and HTTP layers.

use crate::auth::Directory;
use crate::bans::BanRegistry;
use crate::combos::Combos;
use crate::config::Config;
use crate::db::Database;
use crate::entities::EntityExtractor;
use crate::history::History;
use crate::hub::HubHandle;
use crate::names::NamesCache;
use crate::state::ChatState;
use crate::viewerstate::ViewerStateStore;
use std::sync::Arc;

pub struct Backend {
    pub config: Arc<Config>,
    pub hub: HubHandle,
    pub names: Arc<NamesCache>,
    pub state: Arc<ChatState>,
    pub bans: Arc<BanRegistry>,
    pub db: Database,
    pub extractor: Arc<EntityExtractor>,
    pub combos: Arc<Combos>,
    pub history: Arc<History>,
    pub viewers: Arc<ViewerStateStore>,
    pub directory: Directory,
}
