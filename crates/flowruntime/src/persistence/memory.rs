use super::check_version;
use async_trait::async_trait;
use flowcore::{FlowFilter, FlowId, FlowState, FlowStore, PageRequest, PagedResult, StoreError};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Process-local store, used by tests and embedded setups
#[derive(Default)]
pub struct InMemoryFlowStore {
    flows: RwLock<HashMap<FlowId, FlowState>>,
}

impl InMemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.flows.read().await.len()
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn save(&self, state: &FlowState) -> Result<u64, StoreError> {
        let mut flows = self.flows.write().await;
        let version = check_version(state, flows.get(&state.flow_id))?;
        let mut stored = state.clone();
        stored.version = version;
        flows.insert(state.flow_id, stored);
        Ok(version)
    }

    async fn load(&self, flow_id: FlowId) -> Result<FlowState, StoreError> {
        self.flows
            .read()
            .await
            .get(&flow_id)
            .cloned()
            .ok_or(StoreError::NotFound(flow_id))
    }

    async fn query(&self, filter: &FlowFilter, page: PageRequest) -> Result<PagedResult<FlowState>, StoreError> {
        let flows = self.flows.read().await;
        let matching: Vec<FlowState> = flows.values().filter(|f| filter.matches(f)).cloned().collect();
        Ok(PagedResult::from_sorted(matching, page, |f| (f.created_at, f.flow_id)))
    }
}
