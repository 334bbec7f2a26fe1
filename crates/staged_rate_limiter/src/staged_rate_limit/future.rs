use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
};

use pin_project::pin_project;
use tokio::time::{Sleep, sleep};

use super::StagedRateController;

#[pin_project(project = StateProj)]
enum State<F, T> {
    Called {
        #[pin]
        future: F,
    },
    Delayed {
        #[pin]
        sleep: Sleep,
        response: Option<T>,
    },
}

/// Future for the [`StagedRateLimit`](super::StagedRateLimit) service.
#[pin_project]
pub struct ResponseFuture<F, T> {
    #[pin]
    state: State<F, T>,
    controller: Arc<StagedRateController>,
}

impl<F, T> ResponseFuture<F, T> {
    pub(super) const fn new(future: F, controller: Arc<StagedRateController>) -> Self {
        Self {
            state: State::Called { future },
            controller,
        }
    }
}

impl<F, T, E> Future for ResponseFuture<F, T>
where
    F: Future<Output = Result<T, E>>,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        loop {
            match this.state.as_mut().project() {
                StateProj::Called { future } => match ready!(future.poll(cx)) {
                    Ok(response) => {
                        let wait = this.controller.claim_permit();
                        if wait.is_zero() {
                            return Poll::Ready(Ok(response));
                        }
                        this.state.set(State::Delayed {
                            sleep: sleep(wait),
                            response: Some(response),
                        });
                    }
                    Err(error) => {
                        this.controller.report_failure();
                        return Poll::Ready(Err(error));
                    }
                },
                StateProj::Delayed { sleep, response } => {
                    ready!(sleep.poll(cx));
                    let response = response.take().expect("response polled after completion");
                    return Poll::Ready(Ok(response));
                }
            }
        }
    }
}
