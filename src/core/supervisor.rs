//! 会话监管：取消与暂停信号
//!
//! 每个在途会话持有一个 SessionSupervisor。取消与暂停都只在步骤边界生效：
//! 正在执行的动作跑完（成功或失败）后，执行循环才读取这里的信号。

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// 会话级生命周期信号：取消令牌与暂停标记
#[derive(Debug)]
pub struct SessionSupervisor {
    /// 用户 cancel 或进程关闭时触发
    cancel_token: CancellationToken,
    /// 暂停标记（会话状态的快路径镜像，由编排层维护）
    paused: Arc<RwLock<bool>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            paused: Arc::new(RwLock::new(false)),
        }
    }

    /// 以父 token 派生（进程关闭联动取消所有会话）
    pub fn with_parent(parent: &CancellationToken) -> Self {
        Self {
            cancel_token: parent.child_token(),
            paused: Arc::new(RwLock::new(false)),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub async fn is_paused(&self) -> bool {
        *self.paused.read().await
    }

    pub async fn set_paused(&self, paused: bool) {
        *self.paused.write().await = paused;
    }

    /// 创建子 token（单个步骤用）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
