//! Timer & event scheduler (C1, spec.md §4.1), grounded on
//! `examples/original_source/src/timer.c`'s `timer_add`/`timer_process` pair:
//! a bounded table of countdown timers, each advanced by the elapsed-cycle
//! delta and fired when its count reaches zero. Registration order is the
//! tie-break for simultaneous expiry, matching the original's linear `for`
//! scan picking the lowest index first.

use crate::error::ResourceExhausted;

pub const MAX_TIMERS: usize = 32;

pub type TimerId = usize;

struct Timer {
    present: bool,
    count: i64,
    callback: Box<dyn FnMut(&mut dyn std::any::Any)>,
}

/// Countdown-timer table (spec.md §4.1). Time advances in guest cycles;
/// `advance` debits every enabled timer and fires callbacks for any that
/// reach zero or below, lowest-index-first when several expire together.
pub struct Scheduler {
    timers: Vec<Timer>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler { timers: Vec::new() }
    }

    /// Registers a new timer with an initial countdown of `count` cycles.
    /// Returns the slot index, which is also the tie-break priority for
    /// simultaneous expiry (spec.md §4.1, §8 scenario 3).
    pub fn timer_add(
        &mut self,
        count: i64,
        callback: Box<dyn FnMut(&mut dyn std::any::Any)>,
    ) -> Result<TimerId, ResourceExhausted> {
        if let Some(slot) = self.timers.iter().position(|t| !t.present) {
            self.timers[slot] = Timer {
                present: true,
                count,
                callback,
            };
            return Ok(slot);
        }
        if self.timers.len() >= MAX_TIMERS {
            return Err(ResourceExhausted::TimerTableFull { max: MAX_TIMERS });
        }
        self.timers.push(Timer {
            present: true,
            count,
            callback,
        });
        Ok(self.timers.len() - 1)
    }

    pub fn timer_remove(&mut self, id: TimerId) {
        if let Some(t) = self.timers.get_mut(id) {
            t.present = false;
        }
    }

    pub fn timer_reschedule(&mut self, id: TimerId, count: i64) {
        if let Some(t) = self.timers.get_mut(id) {
            t.count = count;
        }
    }

    /// The number of cycles until the next timer is due, or `None` if no timer
    /// is enabled — used by the outer run loop to size its next run slice
    /// (spec.md §4.1, mirroring `timer_update_outstanding`'s latch computation).
    pub fn time_until_next_event(&self) -> Option<i64> {
        self.timers
            .iter()
            .filter(|t| t.present)
            .map(|t| t.count)
            .min()
    }

    /// Debits every enabled timer by `elapsed` cycles and fires, in
    /// registration order, every timer whose count has reached zero or below.
    /// A fired timer's callback is responsible for rescheduling it via
    /// `timer_reschedule` if it recurs; one that doesn't is left expired
    /// (count <= 0) and will fire again next call unless removed.
    pub fn advance(&mut self, elapsed: i64, context: &mut dyn std::any::Any) {
        for t in self.timers.iter_mut().filter(|t| t.present) {
            t.count -= elapsed;
        }
        // A timer fires at most once per `advance` call even if its callback
        // leaves it still due; a callback that wants to keep firing reschedules
        // to a positive count and is picked up on the next call. This still lets
        // one timer's callback bring another, distinct timer due within the same
        // pass (cascading), matching `timer_process`'s retry loop.
        let mut fired = vec![false; self.timers.len()];
        loop {
            let due = self
                .timers
                .iter()
                .enumerate()
                .filter(|(i, t)| t.present && t.count <= 0 && !fired[*i])
                .map(|(i, _)| i)
                .next();
            match due {
                Some(i) => {
                    fired[i] = true;
                    (self.timers[i].callback)(context);
                }
                None => break,
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn timer_fires_when_count_reaches_zero() {
        let fired = Rc::new(RefCell::new(false));
        let fired2 = fired.clone();
        let mut sched = Scheduler::new();
        sched
            .timer_add(10, Box::new(move |_| *fired2.borrow_mut() = true))
            .unwrap();
        sched.advance(5, &mut ());
        assert!(!*fired.borrow());
        sched.advance(5, &mut ());
        assert!(*fired.borrow());
    }

    #[test]
    fn simultaneous_expiry_fires_lowest_index_first() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut sched = Scheduler::new();
        for i in 0..3 {
            let order = order.clone();
            sched
                .timer_add(5, Box::new(move |_| order.borrow_mut().push(i)))
                .unwrap();
        }
        sched.advance(5, &mut ());
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn rescheduled_timer_fires_again_later() {
        let count = Rc::new(RefCell::new(0));
        let mut sched = Scheduler::new();
        let id = {
            let count = count.clone();
            sched
                .timer_add(5, Box::new(move |_| *count.borrow_mut() += 1))
                .unwrap()
        };
        sched.advance(5, &mut ());
        assert_eq!(*count.borrow(), 1);
        sched.timer_reschedule(id, 5);
        sched.advance(5, &mut ());
        assert_eq!(*count.borrow(), 2);
    }

    #[test]
    fn table_full_reports_resource_exhausted() {
        let mut sched = Scheduler::new();
        for _ in 0..MAX_TIMERS {
            sched.timer_add(100, Box::new(|_| {})).unwrap();
        }
        assert!(matches!(
            sched.timer_add(100, Box::new(|_| {})),
            Err(ResourceExhausted::TimerTableFull { max: MAX_TIMERS })
        ));
    }
}
