//! Event loop (C1): a single-threaded readiness reactor built directly on
//! `mio`, since the design calls for explicit per-fd READ/WRITE
//! (un)registration and millisecond-resolution timers rather than a
//! task-based async runtime. Everything above this layer (broker, node,
//! server core) runs its callbacks on the thread that calls
//! [`EventLoop::run`].

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::event::Source;
use mio::{Interest, Poll, Token, Waker};

use crate::socket::SocketEngine;

/// Readiness a registered source can be interested in: READ and WRITE are
/// tracked as separate bits so arming one never disturbs the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interests {
    pub read: bool,
    pub write: bool,
}

impl Interests {
    pub const NONE: Interests = Interests { read: false, write: false };
    pub const READ: Interests = Interests { read: true, write: false };
    pub const WRITE: Interests = Interests { read: false, write: true };
    pub const BOTH: Interests = Interests { read: true, write: true };

    fn to_mio(self) -> Option<Interest> {
        match (self.read, self.write) {
            (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Unique id for a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

struct TimerEntry {
    deadline: Instant,
    id: TimerId,
    period: Option<Duration>,
    generation: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline sorts first.
        other.deadline.cmp(&self.deadline)
    }
}

const WAKE_TOKEN: Token = Token(usize::MAX);

/// The single-threaded reactor. One instance per process in normal
/// server-core usage.
pub struct EventLoop {
    poll: Poll,
    waker: Arc<Waker>,
    events: mio::Events,
    read_handlers: HashMap<Token, Box<dyn FnMut() + Send>>,
    write_handlers: HashMap<Token, Box<dyn FnMut() + Send>>,
    current_interests: HashMap<Token, Interests>,
    timers: BinaryHeap<TimerEntry>,
    timer_generations: HashMap<TimerId, u64>,
    next_timer_id: AtomicU64,
    timer_callbacks: HashMap<TimerId, Box<dyn FnMut() + Send>>,
    running_timer: Option<TimerId>,
    stop_flag: Arc<AtomicBool>,
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Self {
            poll,
            waker,
            events: mio::Events::with_capacity(1024),
            read_handlers: HashMap::new(),
            write_handlers: HashMap::new(),
            current_interests: HashMap::new(),
            timers: BinaryHeap::new(),
            timer_generations: HashMap::new(),
            next_timer_id: AtomicU64::new(1),
            timer_callbacks: HashMap::new(),
            running_timer: None,
            stop_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A cloneable handle that can call [`EventLoop::request_stop`] from
    /// another thread, unblocking a `poll()` in progress.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: self.stop_flag.clone(),
            waker: self.waker.clone(),
        }
    }

    /// Registers `source` for the given interests under `token`. Calling
    /// this again for the same token re-arms (not stacks) the interest,
    /// matching "re-arming a method inside its own callback is legal".
    pub fn register(
        &mut self,
        source: &mut dyn SocketEngine,
        token: Token,
        interests: Interests,
        on_read: Option<Box<dyn FnMut() + Send>>,
        on_write: Option<Box<dyn FnMut() + Send>>,
    ) -> io::Result<()> {
        if let Some(mio_interest) = interests.to_mio() {
            source.io_register(self.poll.registry(), token, mio_interest)?;
        }
        self.current_interests.insert(token, interests);
        if let Some(cb) = on_read {
            self.read_handlers.insert(token, cb);
        }
        if let Some(cb) = on_write {
            self.write_handlers.insert(token, cb);
        }
        Ok(())
    }

    /// Re-arms `token`'s interests to exactly `interests`, without
    /// touching the stored handlers.
    pub fn reregister(
        &mut self,
        source: &mut dyn SocketEngine,
        token: Token,
        interests: Interests,
    ) -> io::Result<()> {
        match interests.to_mio() {
            Some(mio_interest) => {
                source.io_reregister(self.poll.registry(), token, mio_interest)?;
            }
            None => {
                // mio has no "interest in nothing"; deregister instead and
                // remember we did, so a later re-arm re-registers cleanly.
                let _ = source.io_deregister(self.poll.registry());
            }
        }
        self.current_interests.insert(token, interests);
        Ok(())
    }

    pub fn unregister(&mut self, source: &mut dyn SocketEngine, token: Token) -> io::Result<()> {
        let _ = source.io_deregister(self.poll.registry());
        self.current_interests.remove(&token);
        self.read_handlers.remove(&token);
        self.write_handlers.remove(&token);
        Ok(())
    }

    pub fn interests_of(&self, token: Token) -> Interests {
        self.current_interests.get(&token).copied().unwrap_or(Interests::NONE)
    }

    /// Registers a plain `mio::event::Source` (a listening socket, not a
    /// [`SocketEngine`]) directly. Listeners only ever need READ and never
    /// go through the broker read/write dispatch path, so they skip the
    /// `SocketEngine` indirection entirely.
    pub fn register_source(&mut self, source: &mut dyn Source, token: Token, interests: Interests) -> io::Result<()> {
        if let Some(mio_interest) = interests.to_mio() {
            source.register(self.poll.registry(), token, mio_interest)?;
        }
        self.current_interests.insert(token, interests);
        Ok(())
    }

    pub fn deregister_source(&mut self, source: &mut dyn Source, token: Token) -> io::Result<()> {
        let _ = source.deregister(self.poll.registry());
        self.current_interests.remove(&token);
        Ok(())
    }

    /// Polls once and returns the read-ready / write-ready tokens
    /// directly, without invoking any closures registered via
    /// [`EventLoop::register`]. [`crate::node::Node`] uses this to
    /// dispatch by token lookup instead, avoiding a re-entrant borrow of
    /// `Node` from inside its own poll loop.
    pub fn poll_ready(&mut self, readable: &mut Vec<Token>, writable: &mut Vec<Token>) -> io::Result<()> {
        readable.clear();
        writable.clear();
        let timeout = self.next_timer_wait();
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }
        for event in self.events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                continue;
            }
            if event.is_readable() {
                readable.push(token);
            }
            if event.is_writable() {
                writable.push(token);
            }
        }
        self.fire_due_timers();
        Ok(())
    }

    /// Schedules `callback` to fire once after `delay`, or every `delay`
    /// if `periodic` is true.
    pub fn schedule_timer(
        &mut self,
        delay: Duration,
        periodic: bool,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerId {
        let id = TimerId(self.next_timer_id.fetch_add(1, Ordering::Relaxed));
        self.timer_generations.insert(id, 0);
        self.timer_callbacks.insert(id, Box::new(callback));
        self.timers.push(TimerEntry {
            deadline: Instant::now() + delay,
            id,
            period: periodic.then_some(delay),
            generation: 0,
        });
        id
    }

    /// Cancels a timer. A no-op if the timer already fired, doesn't exist,
    /// or is the one currently executing (its callback finishes as the
    /// spec requires, it just won't be rescheduled afterwards).
    pub fn cancel_timer(&mut self, id: TimerId) {
        if self.running_timer == Some(id) {
            self.timer_generations.remove(&id);
            self.timer_callbacks.remove(&id);
            return;
        }
        self.timer_generations.remove(&id);
        self.timer_callbacks.remove(&id);
    }

    fn next_timer_wait(&self) -> Option<Duration> {
        self.timers.peek().map(|t| {
            let now = Instant::now();
            if t.deadline > now {
                t.deadline - now
            } else {
                Duration::ZERO
            }
        })
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        loop {
            let due = match self.timers.peek() {
                Some(t) if t.deadline <= now => true,
                _ => false,
            };
            if !due {
                break;
            }
            let entry = self.timers.pop().unwrap();
            let still_valid = self.timer_generations.get(&entry.id) == Some(&entry.generation);
            if !still_valid {
                continue;
            }
            self.running_timer = Some(entry.id);
            if let Some(cb) = self.timer_callbacks.get_mut(&entry.id) {
                cb();
            }
            self.running_timer = None;
            if let Some(period) = entry.period {
                if self.timer_generations.contains_key(&entry.id) {
                    let gen = self.timer_generations.get_mut(&entry.id).unwrap();
                    *gen += 1;
                    let next_gen = *gen;
                    self.timers.push(TimerEntry {
                        deadline: Instant::now() + period,
                        id: entry.id,
                        period: Some(period),
                        generation: next_gen,
                    });
                }
            } else {
                self.timer_callbacks.remove(&entry.id);
                self.timer_generations.remove(&entry.id);
            }
        }
    }

    /// Runs one poll iteration: waits up to the next timer deadline (or
    /// forever if none), dispatches readiness to read/write handlers, then
    /// fires any timers now due.
    pub fn run_once(&mut self) -> io::Result<()> {
        let timeout = self.next_timer_wait();
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let mut to_read = Vec::new();
        let mut to_write = Vec::new();
        for event in self.events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                continue;
            }
            if event.is_readable() {
                to_read.push(token);
            }
            if event.is_writable() {
                to_write.push(token);
            }
        }
        for token in to_read {
            if let Some(handler) = self.read_handlers.get_mut(&token) {
                handler();
            }
        }
        for token in to_write {
            if let Some(handler) = self.write_handlers.get_mut(&token) {
                handler();
            }
        }

        self.fire_due_timers();
        Ok(())
    }

    /// Runs until [`StopHandle::request_stop`] is called (from this
    /// thread or another).
    pub fn run(&mut self) -> io::Result<()> {
        self.stop_flag.store(false, Ordering::SeqCst);
        while !self.stop_flag.load(Ordering::SeqCst) {
            self.run_once()?;
        }
        Ok(())
    }
}

/// A cross-thread-safe handle to stop a running [`EventLoop`].
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl StopHandle {
    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn timer_fires_once_after_delay() {
        let mut reactor = EventLoop::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        reactor.schedule_timer(Duration::from_millis(5), false, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        let deadline = Instant::now() + Duration::from_secs(1);
        while fired.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            reactor.run_once().unwrap();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut reactor = EventLoop::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let id = reactor.schedule_timer(Duration::from_millis(5), false, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        reactor.cancel_timer(id);

        for _ in 0..5 {
            reactor.run_once().unwrap();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stop_handle_unblocks_run_from_another_thread() {
        let mut reactor = EventLoop::new().unwrap();
        let stop = reactor.stop_handle();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            stop.request_stop();
        });
        reactor.run().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn periodic_timer_reschedules_itself() {
        let mut reactor = EventLoop::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        reactor.schedule_timer(Duration::from_millis(2), true, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let deadline = Instant::now() + Duration::from_millis(200);
        while count.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            reactor.run_once().unwrap();
        }
        assert!(count.load(Ordering::SeqCst) >= 3);
    }
}
