//! Progress reporting for embedding computation
//!
//! Reporters are called synchronously from the thread doing the computation.
//! Forwarding progress to another thread (e.g. a UI) is up to the reporter.

/// Receives the total step count once, then step increments
pub trait ProgressReporter {
    fn init(&mut self, total: usize, description: &str);

    fn update(&mut self, n: usize);

    fn finish(&mut self) {}
}

/// Reporter that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn init(&mut self, _total: usize, _description: &str) {}

    fn update(&mut self, _n: usize) {}
}

/// Reporter backed by two caller-supplied callbacks
pub struct CallbackProgress<I, U> {
    init: I,
    update: U,
}

impl<I, U> CallbackProgress<I, U>
where
    I: FnMut(usize, &str),
    U: FnMut(usize),
{
    pub fn new(init: I, update: U) -> Self {
        Self { init, update }
    }
}

impl<I, U> ProgressReporter for CallbackProgress<I, U>
where
    I: FnMut(usize, &str),
    U: FnMut(usize),
{
    fn init(&mut self, total: usize, description: &str) {
        (self.init)(total, description);
    }

    fn update(&mut self, n: usize) {
        (self.update)(n);
    }
}

/// Reporter that logs every 10% of progress
#[derive(Debug, Default)]
pub struct LogProgress {
    description: String,
    total: usize,
    done: usize,
    last_decile: usize,
}

impl LogProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn done(&self) -> usize {
        self.done
    }
}

impl ProgressReporter for LogProgress {
    fn init(&mut self, total: usize, description: &str) {
        self.description = description.to_string();
        self.total = total;
        self.done = 0;
        self.last_decile = 0;
        log::info!("{}: {} steps", description, total);
    }

    fn update(&mut self, n: usize) {
        self.done += n;
        if self.total == 0 {
            return;
        }
        let decile = (self.done * 10 / self.total).min(10);
        if decile > self.last_decile {
            self.last_decile = decile;
            log::info!(
                "{}: {}/{} ({}%)",
                self.description,
                self.done,
                self.total,
                decile * 10
            );
        }
    }

    fn finish(&mut self) {
        log::debug!("{}: finished after {} steps", self.description, self.done);
    }
}
