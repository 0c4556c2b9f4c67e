use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::error::SessionError;
use crate::session::Session;

/// Low-risk interaction performed while waiting out a challenge.
#[async_trait]
pub trait HumanBehavior: Send + Sync {
    async fn perform(&self, session: &dyn Session) -> Result<(), SessionError>;
}

/// Does nothing. Used in tests and for non-rendering sessions.
pub struct NoopBehavior;

#[async_trait]
impl HumanBehavior for NoopBehavior {
    async fn perform(&self, _session: &dyn Session) -> Result<(), SessionError> {
        Ok(())
    }
}

enum Step {
    Pointer(i64, i64),
    Scroll(i64),
    Pause(Duration),
}

/// A few jittered pointer moves and small scrolls per round.
pub struct RandomizedBehavior {
    steps_per_round: usize,
}

impl Default for RandomizedBehavior {
    fn default() -> Self {
        Self { steps_per_round: 4 }
    }
}

impl RandomizedBehavior {
    fn plan(&self) -> Vec<Step> {
        // Built up front: the thread-local rng must not live across an await.
        let mut rng = rand::rng();
        let mut steps = Vec::with_capacity(self.steps_per_round * 2);
        for _ in 0..self.steps_per_round {
            let step = if rng.random_bool(0.7) {
                Step::Pointer(rng.random_range(-120..=120), rng.random_range(-80..=80))
            } else {
                Step::Scroll(rng.random_range(40..=260))
            };
            steps.push(step);
            steps.push(Step::Pause(Duration::from_millis(rng.random_range(80..=400))));
        }
        steps
    }
}

#[async_trait]
impl HumanBehavior for RandomizedBehavior {
    async fn perform(&self, session: &dyn Session) -> Result<(), SessionError> {
        for step in self.plan() {
            match step {
                Step::Pointer(x, y) => session.move_pointer(x, y).await?,
                Step::Scroll(px) => session.scroll_by(px).await?,
                Step::Pause(d) => tokio::time::sleep(d).await,
            }
        }
        Ok(())
    }
}
