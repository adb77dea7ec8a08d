//! 执行器注册表
//!
//! 执行器能力集是封闭的（见ExecutorKind），提交时解析一次，
//! Worker池对执行器类型保持无感知。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::info;

use jobcenter_domain::ports::Executor;
use jobcenter_domain::ExecutorKind;

#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<ExecutorKind, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        let kind = executor.kind();
        info!("注册任务执行器: {}", kind.as_str());
        self.executors.insert(kind, executor);
    }

    pub fn with(mut self, executor: Arc<dyn Executor>) -> Self {
        self.register(executor);
        self
    }

    pub fn get(&self, kind: ExecutorKind) -> Option<Arc<dyn Executor>> {
        self.executors.get(&kind).cloned()
    }

    /// 已注册的执行器类型集合，提交校验用
    pub fn kinds(&self) -> HashSet<ExecutorKind> {
        self.executors.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
