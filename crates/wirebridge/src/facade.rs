//! Typed application API over the bridge.
//!
//! Each operation is one worker method with typed params. Depends only on
//! [`RpcCaller`], so it works with any caller, including test doubles.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::RpcCaller;
use crate::error::{BridgeError, Result};

/// An application window reported by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
    /// Fields this side does not model.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    #[default]
    Grid,
    SideBySide,
}

/// Optional knobs for `arrange_windows`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArrangeOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cols: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ArrangeParams {
    layout: Layout,
    #[serde(flatten)]
    options: ArrangeOptions,
}

#[derive(Debug, Serialize)]
struct SendPromptParams<'a> {
    prompt: &'a str,
    selected_apps: &'a [String],
}

#[derive(Debug, Serialize)]
struct UpdateConfigParams<'a> {
    config: &'a Value,
}

/// High-level window-manager API.
pub struct WindowManager {
    caller: Arc<dyn RpcCaller>,
    active_apps: Mutex<Vec<AppInfo>>,
}

impl WindowManager {
    pub fn new(caller: Arc<dyn RpcCaller>) -> Self {
        Self {
            caller,
            active_apps: Mutex::new(Vec::new()),
        }
    }

    async fn invoke(&self, method: &str, params: impl Serialize) -> Result<Value> {
        let params =
            serde_json::to_value(params).map_err(|e| BridgeError::InvalidParams(e.to_string()))?;
        self.caller.call(method, params).await.inspect_err(|e| {
            tracing::warn!(%method, error = %e, "Window manager call failed");
        })
    }

    /// Applications the worker currently sees. A `null` result is an empty list.
    ///
    /// The last successful list is cached; see [`WindowManager::cached_apps`].
    pub async fn active_apps(&self) -> Result<Vec<AppInfo>> {
        let result = self.invoke("get_active_apps", Value::Null).await?;
        let apps: Vec<AppInfo> = match result {
            Value::Null => Vec::new(),
            other => serde_json::from_value(other).map_err(|e| BridgeError::Decode(e.to_string()))?,
        };
        tracing::debug!(count = apps.len(), "Active apps");
        *self.lock_apps() = apps.clone();
        Ok(apps)
    }

    pub fn cached_apps(&self) -> Vec<AppInfo> {
        self.lock_apps().clone()
    }

    fn lock_apps(&self) -> std::sync::MutexGuard<'_, Vec<AppInfo>> {
        self.active_apps.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Active apps cache poisoned - recovering");
            poisoned.into_inner()
        })
    }

    pub async fn arrange_windows(&self, layout: Layout, options: ArrangeOptions) -> Result<Value> {
        self.invoke("arrange_windows", ArrangeParams { layout, options })
            .await
    }

    pub async fn start_all_apps(&self) -> Result<Value> {
        self.invoke("start_ai_apps", Value::Null).await
    }

    pub async fn close_all_apps(&self) -> Result<Value> {
        self.invoke("close_all", Value::Null).await
    }

    pub async fn minimize_all(&self) -> Result<Value> {
        self.invoke("minimize_all", Value::Null).await
    }

    pub async fn restore_all(&self) -> Result<Value> {
        self.invoke("restore_all", Value::Null).await
    }

    /// Send `prompt` to the named apps (all apps when empty).
    pub async fn send_prompt(&self, prompt: &str, selected_apps: &[String]) -> Result<Value> {
        self.invoke(
            "send_prompt",
            SendPromptParams {
                prompt,
                selected_apps,
            },
        )
        .await
    }

    pub async fn get_config(&self) -> Result<Value> {
        self.invoke("get_config", Value::Null).await
    }

    pub async fn update_config(&self, config: &Value) -> Result<Value> {
        self.invoke("update_config", UpdateConfigParams { config })
            .await
    }
}
