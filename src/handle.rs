use super::{
    errors::PoolError,
    model::WorkerId,
};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll}
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;


/// Handle на воркер в реестре пула: токен вывода из работы + join
pub(crate) struct WorkerHandle {
    id: WorkerId,
    retire_token: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {

    pub fn new
    (
        id: WorkerId,
        retire_token: CancellationToken,
        join: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            retire_token,
            join,
        }
    }

    #[inline]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Воркер доделает текущую задачу и выйдет
    #[inline]
    pub fn retire(&self) {
        self.retire_token.cancel();
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl Future for WorkerHandle {
    type Output = Result<(), PoolError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.join).poll(cx) {
            Poll::Ready(res) => Poll::Ready(res.map_err(|join_err| PoolError::WorkerLost {
                worker: this.id,
                reason: join_err.to_string(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}
