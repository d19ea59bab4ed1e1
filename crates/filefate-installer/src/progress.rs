#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase {
    Start,
    Progress,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub phase: ProgressPhase,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

pub(crate) struct ProgressSink<F> {
    callback: F,
    total: u64,
    done: u64,
}

impl<F: FnMut(ProgressEvent)> ProgressSink<F> {
    pub(crate) fn start(mut callback: F, total: u64) -> Self {
        callback(ProgressEvent {
            phase: ProgressPhase::Start,
            bytes_done: 0,
            bytes_total: total,
        });
        Self {
            callback,
            total,
            done: 0,
        }
    }

    pub(crate) fn advance(&mut self, bytes: u64) {
        self.done = self.done.saturating_add(bytes).min(self.total);
        (self.callback)(ProgressEvent {
            phase: ProgressPhase::Progress,
            bytes_done: self.done,
            bytes_total: self.total,
        });
    }

    pub(crate) fn done(&self) -> u64 {
        self.done
    }

    pub(crate) fn stop(mut self) {
        (self.callback)(ProgressEvent {
            phase: ProgressPhase::Stop,
            bytes_done: self.done,
            bytes_total: self.total,
        });
    }
}
