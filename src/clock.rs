// Copyright 2025 Cornell University
// released under MIT License

use crate::channels::on_send;
use crate::config::{Duration, TimeUnit};
use crate::eval::Value;
use crate::network::{Assignment, Automaton, Expr, LValue, Op, SyncVector, VarDecl};
use crate::types::{IntWidth, Type};

pub const CLOCK: &str = "global_timer";
pub const TICK: &str = "global_timer_tick";
/// Global time, in `Clock::unit`
pub const TIME: &str = "t";

pub fn due_flag(channel: &str) -> String {
    format!("{}.due", channel)
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// The shared discrete clock driving every timer channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clock {
    pub unit: TimeUnit,
    /// Time advanced by one tick
    pub step: u64,
    pub max_time: u64,
    /// Timer channels with their periods, in `unit`
    pub timers: Vec<(String, u64)>,
}

impl Clock {
    /// `None` when there is nothing to drive. Periods are in nanoseconds.
    pub fn new(timers: &[(&str, u64)], max_time: &Duration) -> Option<Self> {
        if timers.is_empty() {
            return None;
        }
        let all: Vec<u64> = timers
            .iter()
            .map(|(_, p)| *p)
            .chain(std::iter::once(max_time.as_nanos()))
            .collect();
        let unit = TimeUnit::ALL
            .into_iter()
            .find(|u| all.iter().all(|n| n % u.nanos() == 0))
            .unwrap_or(TimeUnit::Ns);
        let timers: Vec<(String, u64)> = timers
            .iter()
            .map(|(name, p)| (name.to_string(), p / unit.nanos()))
            .collect();
        let step = timers.iter().fold(0, |acc, (_, p)| gcd(acc, *p));
        log::info!(
            "clock: {} timer(s), step {}{}, max time {}",
            timers.len(),
            step,
            unit.suffix(),
            max_time
        );
        Some(Self {
            unit,
            step,
            max_time: max_time.as_nanos() / unit.nanos(),
            timers,
        })
    }

    /// `t` followed by one due flag per timer. Every timer is due at 0.
    pub fn globals(&self) -> Vec<VarDecl> {
        let mut out = vec![VarDecl {
            name: TIME.to_string(),
            tpe: Type::int(true, IntWidth::W64),
            init: Value::Int(0),
        }];
        for (channel, _) in &self.timers {
            out.push(VarDecl {
                name: due_flag(channel),
                tpe: Type::Bool,
                init: Value::Bool(true),
            });
        }
        out
    }

    /// One location; a tick edge that advances time and recomputes every
    /// due flag at once, and one send edge per timer that is enabled while
    /// the timer is due.
    pub fn automaton(&self) -> Automaton {
        let mut automaton = Automaton::new(CLOCK, "loc");
        let loc = automaton.initial;
        let time = Expr::var(TIME);
        let next = Expr::binary(Op::Add, time.clone(), Expr::Int(self.step as i64));
        let in_time = Expr::binary(Op::Le, next.clone(), Expr::Int(self.max_time as i64));
        let none_due = Expr::conjunction(
            self.timers
                .iter()
                .map(|(c, _)| Expr::not(Expr::var(due_flag(c)))),
        );
        let mut assignments = vec![Assignment {
            target: LValue::var(TIME),
            value: next,
            index: 0,
        }];
        for (channel, period) in &self.timers {
            assignments.push(Assignment {
                target: LValue::var(due_flag(channel)),
                value: Expr::binary(
                    Op::Eq,
                    Expr::binary(Op::Rem, time.clone(), Expr::Int(*period as i64)),
                    Expr::Int(0),
                ),
                index: 1,
            });
        }
        automaton.edge(loc, TICK, Expr::and(in_time, none_due), loc, assignments);
        for (channel, _) in &self.timers {
            let flag = due_flag(channel);
            automaton.edge(
                loc,
                on_send(channel),
                Expr::var(flag.clone()),
                loc,
                vec![Assignment {
                    target: LValue::var(flag),
                    value: Expr::Bool(false),
                    index: 0,
                }],
            );
        }
        automaton
    }
}

/// The tick fires together with the `enable` self-loop of every channel in
/// `gated`, so time only passes while all of them are empty
pub fn tick_sync(clock: usize, gated: &[usize], size: usize) -> SyncVector {
    let mut participants = vec![None; size];
    participants[clock] = Some(TICK.to_string());
    for channel in gated {
        participants[*channel] = Some(crate::channels::CLOCK_ENABLE.to_string());
    }
    SyncVector {
        participants,
        result: TICK.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_and_step() {
        let max = Duration::new(10, TimeUnit::S);
        let clock = Clock::new(&[("a", 1_000_000_000), ("b", 2_000_000_000)], &max).unwrap();
        assert_eq!(clock.unit, TimeUnit::S);
        assert_eq!(clock.step, 1);
        assert_eq!(clock.max_time, 10);
        assert_eq!(clock.timers[1], ("b".to_string(), 2));

        let clock = Clock::new(&[("a", 250_000_000), ("b", 1_500_000_000)], &max).unwrap();
        assert_eq!(clock.unit, TimeUnit::Ms);
        assert_eq!(clock.step, 250);
        assert_eq!(clock.max_time, 10_000);

        assert!(Clock::new(&[], &max).is_none());
    }

    #[test]
    fn tick_recomputes_all_flags_together() {
        let max = Duration::new(4, TimeUnit::S);
        let clock = Clock::new(&[("a", 1_000_000_000), ("b", 2_000_000_000)], &max).unwrap();
        let automaton = clock.automaton();
        assert_eq!(automaton.edges.len(), 3);
        let tick = &automaton.edges[0];
        assert_eq!(tick.action, TICK);
        assert_eq!(tick.guard.to_string(), "((t + 1) <= 4) && (!a.due && !b.due)");
        let levels: Vec<u32> = tick.destinations[0]
            .assignments
            .iter()
            .map(|a| a.index)
            .collect();
        assert_eq!(levels, vec![0, 1, 1]);
        assert_eq!(automaton.edges[2].action, "b_on_send");
        let globals: Vec<_> = clock.globals().into_iter().map(|g| g.name).collect();
        assert_eq!(globals, vec!["t", "a.due", "b.due"]);
    }

    #[test]
    fn tick_vector() {
        let sync = tick_sync(3, &[0, 2], 4);
        assert_eq!(
            sync.participants,
            vec![
                Some("global_timer_enable".to_string()),
                None,
                Some("global_timer_enable".to_string()),
                Some("global_timer_tick".to_string())
            ]
        );
    }
}
