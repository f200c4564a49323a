use std::sync::Arc;

use omc_auth::{PermissionCache, TokenSigner};
use omc_campaigns::CampaignService;
use omc_core::InboundEvent;
use omc_hub::HubHandle;
use omc_outbox::OutboxDispatcher;
use omc_storage::Store;
use omc_transfers::TransferManager;
use tokio::sync::mpsc;

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub hub: HubHandle,
    pub signer: TokenSigner,
    pub permissions: PermissionCache,
    pub transfers: TransferManager,
    pub outbox: OutboxDispatcher,
    pub campaigns: CampaignService,
    pub pipeline_tx: mpsc::Sender<InboundEvent>,
    pub provider: Arc<dyn omc_core::ChatProvider>,
}
