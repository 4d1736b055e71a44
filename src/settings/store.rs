//! SettingsStore：settings.json 的读取缓存、校验保存与变更通知

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{Settings, SettingsError};

/// 订阅句柄，用于取消订阅
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// 一次保存产生的变更
#[derive(Debug, Clone)]
pub struct SettingsChangeEvent {
    pub changed_keys: BTreeSet<String>,
    pub old: Settings,
    pub new: Settings,
    pub timestamp: DateTime<Utc>,
}

impl SettingsChangeEvent {
    pub fn touches(&self, key: &str) -> bool {
        self.changed_keys.contains(key)
    }
}

/// 设置变更订阅者
#[async_trait]
pub trait SettingsObserver: Send + Sync {
    fn name(&self) -> &str;

    async fn on_settings_changed(&self, event: &SettingsChangeEvent) -> anyhow::Result<()>;
}

#[derive(Default)]
struct CachedSettings {
    settings: Option<Settings>,
    modified: Option<SystemTime>,
}

/// settings.json 存储
///
/// - `load` 在文件 mtime 变化时重新读取，文件不存在时写入默认值
/// - `save` 校验 → 比较变更键 → 临时文件 + rename 写盘 → 通知订阅者
pub struct SettingsStore {
    path: Option<PathBuf>,
    state: Mutex<CachedSettings>,
    observers: RwLock<Vec<(SubscriptionId, Arc<dyn SettingsObserver>)>>,
    next_id: AtomicU64,
}

impl SettingsStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            state: Mutex::new(CachedSettings::default()),
            observers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// 不落盘的设置（测试用）
    pub fn in_memory(settings: Settings) -> Self {
        Self {
            path: None,
            state: Mutex::new(CachedSettings {
                settings: Some(settings),
                modified: None,
            }),
            observers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// 读取当前设置（文件有更新时重新加载）
    pub async fn load(&self) -> Result<Settings, SettingsError> {
        let mut state = self.state.lock().await;
        self.load_locked(&mut state).await
    }

    async fn load_locked(&self, state: &mut CachedSettings) -> Result<Settings, SettingsError> {
        let Some(path) = &self.path else {
            return Ok(state.settings.clone().unwrap_or_default());
        };

        match tokio::fs::metadata(path).await {
            Ok(meta) => {
                let modified = meta.modified().ok();
                if let Some(cached) = &state.settings {
                    if modified.is_some() && modified == state.modified {
                        return Ok(cached.clone());
                    }
                }
                let raw = tokio::fs::read_to_string(path).await?;
                let settings: Settings = serde_json::from_str(&raw)?;
                tracing::info!("Settings loaded from {}", path.display());
                state.settings = Some(settings.clone());
                state.modified = modified;
                Ok(settings)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let settings = Settings::default();
                write_settings_file(path, &settings).await?;
                tracing::info!("Settings file not found, created defaults at {}", path.display());
                state.modified = file_modified(path).await;
                state.settings = Some(settings.clone());
                Ok(settings)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// 保存设置并通知订阅者，返回变更的顶层键（无变更时为空且不通知）
    pub async fn save(&self, new: Settings) -> Result<BTreeSet<String>, SettingsError> {
        new.validate()?;

        let event = {
            let mut state = self.state.lock().await;
            let old = self.load_locked(&mut state).await?;
            let changed_keys = old.changed_keys(&new);
            if changed_keys.is_empty() {
                tracing::debug!("Settings unchanged, skip save");
                return Ok(changed_keys);
            }

            if let Some(path) = &self.path {
                write_settings_file(path, &new).await?;
                state.modified = file_modified(path).await;
            }
            state.settings = Some(new.clone());

            SettingsChangeEvent {
                changed_keys,
                old,
                new,
                timestamp: Utc::now(),
            }
        };

        tracing::info!(changed = ?event.changed_keys, "Settings saved");
        if let Err(e) = self.notify(&event).await {
            self.revert(&event).await;
            return Err(e);
        }
        Ok(event.changed_keys)
    }

    /// 订阅者拒绝变更后恢复旧设置（文件 + 缓存），不再通知；期间已被再次保存则不动
    async fn revert(&self, event: &SettingsChangeEvent) {
        let mut state = self.state.lock().await;
        if state.settings.as_ref() != Some(&event.new) {
            tracing::warn!("Settings changed again before rollback, keeping the newer version");
            return;
        }
        if let Some(path) = &self.path {
            if let Err(e) = write_settings_file(path, &event.old).await {
                tracing::error!("Failed to restore previous settings to {}: {}", path.display(), e);
            }
            state.modified = file_modified(path).await;
        }
        state.settings = Some(event.old.clone());
        tracing::warn!(reverted = ?event.changed_keys, "Settings change rejected, previous settings restored");
    }

    /// 注册订阅者
    pub fn subscribe(&self, observer: Arc<dyn SettingsObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        tracing::debug!("Settings observer '{}' subscribed", observer.name());
        self.write_observers().push((id, observer));
        id
    }

    /// 取消订阅，返回该 id 是否存在
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.write_observers();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().map(|o| o.len()).unwrap_or(0)
    }

    /// 依次通知所有订阅者；单个失败不影响其它订阅者，失败汇总后返回
    async fn notify(&self, event: &SettingsChangeEvent) -> Result<(), SettingsError> {
        let observers: Vec<Arc<dyn SettingsObserver>> = match self.observers.read() {
            Ok(o) => o.iter().map(|(_, obs)| Arc::clone(obs)).collect(),
            Err(poisoned) => poisoned.into_inner().iter().map(|(_, obs)| Arc::clone(obs)).collect(),
        };

        let mut failures = Vec::new();
        for observer in observers {
            if let Err(e) = observer.on_settings_changed(event).await {
                tracing::error!("Settings observer '{}' failed: {:#}", observer.name(), e);
                failures.push(format!("{}: {:#}", observer.name(), e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SettingsError::Observer(failures))
        }
    }

    /// 是否自动批准工具调用（每次都重新读取；读取失败按不自动批准处理）
    pub async fn auto_approve_tools(&self) -> bool {
        match self.load().await {
            Ok(s) => s.auto_approve_tools,
            Err(e) => {
                tracing::warn!("Failed to read settings, auto-approve disabled: {}", e);
                false
            }
        }
    }

    /// 审批等待超时
    pub async fn approval_timeout(&self) -> Duration {
        let secs = match self.load().await {
            Ok(s) => s.approval_timeout,
            Err(e) => {
                tracing::warn!("Failed to read settings, using default approval timeout: {}", e);
                Settings::default().approval_timeout
            }
        };
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::from_secs(60))
    }

    fn write_observers(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, Vec<(SubscriptionId, Arc<dyn SettingsObserver>)>> {
        self.observers.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// 先写临时文件再 rename，避免写到一半的 settings.json
async fn write_settings_file(path: &Path, settings: &Settings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let json = serde_json::to_string_pretty(settings)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn file_modified(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok().and_then(|m| m.modified().ok())
}
