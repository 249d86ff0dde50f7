//! 用户状态代理
//!
//! 处理函数通过 map 风格的接口读写状态；`load` 从协作层读取，`save` 写回。
//! 未加载过的状态不会被保存，避免用空状态覆盖服务端数据。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::core::{ApiError, ConnectorError};

/// 状态读写协作方（REST 实现见 `api::ApiClient`）
#[async_trait]
pub trait StateStore: Send + Sync {
    /// 读取状态；不存在时由实现方创建空状态
    async fn read_state(&self, state_id: &str) -> Result<Map<String, Value>, ApiError>;

    async fn update_state(
        &self,
        state_id: &str,
        state: &Map<String, Value>,
    ) -> Result<Map<String, Value>, ApiError>;
}

pub struct StateProxy {
    state_id: String,
    store: Option<Arc<dyn StateStore>>,
    state: Map<String, Value>,
    loaded: bool,
}

impl StateProxy {
    pub fn new(state_id: impl Into<String>, store: Option<Arc<dyn StateStore>>) -> Self {
        Self {
            state_id: state_id.into(),
            store,
            state: Map::new(),
            loaded: false,
        }
    }

    pub fn state_id(&self) -> &str {
        &self.state_id
    }

    pub fn was_loaded(&self) -> bool {
        self.loaded
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.state.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.state.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.state.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.state.iter()
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    fn store(&self) -> Result<&Arc<dyn StateStore>, ConnectorError> {
        self.store
            .as_ref()
            .ok_or_else(|| ConnectorError::Config("no state store configured".to_string()))
    }

    pub async fn load(&mut self) -> Result<(), ConnectorError> {
        tracing::info!(state_id = %self.state_id, "<< Loading state");
        let state = self.store()?.read_state(&self.state_id).await?;
        self.state = state;
        self.loaded = true;
        Ok(())
    }

    pub async fn save(&mut self) -> Result<(), ConnectorError> {
        if !self.loaded {
            tracing::warn!(state_id = %self.state_id, "State was not loaded, skipping save");
            return Ok(());
        }
        if self.state.is_empty() {
            return Ok(());
        }
        tracing::info!(state_id = %self.state_id, ">> Saving state");
        self.store()?.update_state(&self.state_id, &self.state).await?;
        Ok(())
    }
}

static NULL: Value = Value::Null;

impl std::ops::Index<&str> for StateProxy {
    type Output = Value;

    /// 缺失的键返回 Null
    fn index(&self, key: &str) -> &Value {
        self.state.get(key).unwrap_or(&NULL)
    }
}

impl std::fmt::Debug for StateProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateProxy")
            .field("state_id", &self.state_id)
            .field("state", &self.state)
            .field("state_was_loaded", &self.loaded)
            .finish()
    }
}
