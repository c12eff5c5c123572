//! A bounded pool of scarce model handles. With more self-play threads than
//! handles, `acquire` is the back-pressure point that keeps the accelerator
//! from being over-subscribed.

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::model::Model;

pub struct ModelPool {
    tx: Sender<Box<dyn Model>>,
    rx: Receiver<Box<dyn Model>>,
}

impl ModelPool {
    pub fn new(models: Vec<Box<dyn Model>>) -> ModelPool {
        assert!(!models.is_empty());
        let (tx, rx) = bounded(models.len());
        for model in models {
            tx.send(model).unwrap();
        }
        ModelPool { tx, rx }
    }

    /// Blocks until a handle is available.
    pub fn acquire(&self) -> Box<dyn Model> {
        self.rx.recv().expect("model pool closed")
    }

    pub fn release(&self, model: Box<dyn Model>) {
        self.tx.send(model).expect("model pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelFactory;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn handles_cycle_through_the_pool() {
        let factory = ModelFactory::new("uniform", "");
        let pool = ModelPool::new(vec![
            factory.new_model("a.bin").unwrap(),
            factory.new_model("b.bin").unwrap(),
        ]);
        let a = pool.acquire();
        let b = pool.acquire();
        pool.release(a);
        pool.release(b);
        let _ = pool.acquire();
    }

    #[test]
    fn acquire_blocks_until_release() {
        let factory = ModelFactory::new("uniform", "");
        let pool = ModelPool::new(vec![factory.new_model("only.bin").unwrap()]);
        let in_use = AtomicUsize::new(0);
        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..8 {
                        let model = pool.acquire();
                        let now = in_use.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(now, 0, "only one thread may hold the handle");
                        in_use.fetch_sub(1, Ordering::SeqCst);
                        pool.release(model);
                    }
                });
            }
        });
    }
}
