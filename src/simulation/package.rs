use std::collections::{HashMap, VecDeque};

use crate::proxy::{InputBuffer, OutputBuffer, ProxyId};

/** Per-proxy buffers exchanged with the owner thread for one frame. */
#[derive(Debug, Clone, PartialEq)]
pub struct Package<B> {
    pub frame: u64,
    pub objects: HashMap<ProxyId, B>,
}

pub type InputPackage = Package<InputBuffer>;
pub type OutputPackage = Package<OutputBuffer>;

impl<B> Package<B> {
    pub fn new(frame: u64) -> Self {
        Package {
            frame,
            objects: HashMap::new(),
        }
    }

    pub fn get(&self, proxy: ProxyId) -> Option<&B> {
        self.objects.get(&proxy)
    }
}

/**
 * Current and previous input package as seen by the simulation thread. Pushing
 * a new package shifts current into previous. Until the first push both are
 * empty.
 */
#[derive(Debug, Default)]
pub struct InputHistory {
    current: Option<InputPackage>,
    previous: Option<InputPackage>,
}

impl InputHistory {
    pub fn advance(&mut self, newest: Option<InputPackage>) {
        match newest {
            Some(package) => {
                self.previous = self.current.take();
                self.current = Some(package);
            }
            // nothing arrived, the current package also stands in for the previous one
            None => self.previous = self.current.clone(),
        }
    }

    pub fn current(&self) -> Option<&InputPackage> {
        self.current.as_ref()
    }

    pub fn previous(&self) -> Option<&InputPackage> {
        self.previous.as_ref()
    }

    pub fn current_buffer(&self, proxy: ProxyId) -> Option<&InputBuffer> {
        self.current.as_ref().and_then(|p| p.get(proxy))
    }

    pub fn previous_buffer(&self, proxy: ProxyId) -> Option<&InputBuffer> {
        self.previous.as_ref().and_then(|p| p.get(proxy))
    }

    pub fn clear(&mut self) {
        self.current = None;
        self.previous = None;
    }
}

/** Input side of the exchange: only the newest pushed package survives. */
#[derive(Debug, Default)]
pub struct InputSlot {
    latest: Option<InputPackage>,
    superseded: u64,
}

impl InputSlot {
    pub fn push(&mut self, package: InputPackage) {
        if let Some(old) = self.latest.replace(package) {
            self.superseded += 1;
            log::debug!("input package for frame {} superseded before it was consumed", old.frame);
        }
    }

    pub fn take(&mut self) -> Option<InputPackage> {
        self.latest.take()
    }

    pub fn num_superseded(&self) -> u64 {
        self.superseded
    }
}

/** Output side of the exchange: bounded FIFO that drops its oldest entry on overflow. */
#[derive(Debug)]
pub struct OutputQueue {
    packages: VecDeque<OutputPackage>,
    capacity: usize,
}

impl OutputQueue {
    pub fn new(capacity: usize) -> Self {
        OutputQueue {
            packages: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.packages.len() > self.capacity {
            self.drop_oldest();
        }
    }

    fn drop_oldest(&mut self) {
        if let Some(dropped) = self.packages.pop_front() {
            log::warn!("output queue full, dropping package of frame {}", dropped.frame);
        }
    }

    pub fn push(&mut self, package: OutputPackage) {
        if self.packages.len() >= self.capacity {
            self.drop_oldest();
        }
        self.packages.push_back(package);
    }

    pub fn pop(&mut self) -> Option<OutputPackage> {
        self.packages.pop_front()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newest_input_wins() {
        let mut slot = InputSlot::default();
        slot.push(Package::new(1));
        slot.push(Package::new(2));
        assert_eq!(slot.take().map(|p| p.frame), Some(2));
        assert!(slot.take().is_none());
        assert_eq!(slot.num_superseded(), 1);
    }

    #[test]
    fn history_shifts_current_to_previous() {
        let mut history = InputHistory::default();
        history.advance(Some(Package::new(1)));
        assert!(history.previous().is_none());

        history.advance(Some(Package::new(2)));
        assert_eq!(history.previous().map(|p| p.frame), Some(1));
        assert_eq!(history.current().map(|p| p.frame), Some(2));

        history.advance(None);
        assert_eq!(history.previous().map(|p| p.frame), Some(2));
        assert_eq!(history.current().map(|p| p.frame), Some(2));
    }

    #[test]
    fn output_queue_drops_oldest() {
        let mut queue = OutputQueue::new(2);
        for frame in 0..3 {
            queue.push(Package::new(frame));
        }
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().map(|p| p.frame), Some(1));
        assert_eq!(queue.pop().map(|p| p.frame), Some(2));
        assert!(queue.is_empty());
    }
}
