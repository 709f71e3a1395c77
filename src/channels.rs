// Copyright 2025 Cornell University
// released under MIT License

use rustc_hash::FxHashMap;

use crate::errors::{CompileResult, StructuralError, TypeError};
use crate::network::{Automaton, Expr, LocationKind, SyncVector};
use crate::ros::Port;
use crate::types::Type;

/// Label of the clock self-loop every channel with receivers offers while
/// it is empty
pub const CLOCK_ENABLE: &str = "global_timer_enable";

pub fn on_send(channel: &str) -> String {
    format!("{}_on_send", channel)
}

pub fn on_receive(channel: &str) -> String {
    format!("{}_on_receive", channel)
}

/// Name of the flag telling whether a channel ever carried a message
pub fn valid_flag(channel: &str) -> String {
    format!("{}.valid", channel)
}

/// A named point of synchronization between automata
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub name: String,
    /// Struct type of the payload
    pub payload: Option<String>,
    /// Period in nanoseconds of a timer channel
    pub period: Option<u64>,
    /// Positions of the sending automata in the network
    pub senders: Vec<usize>,
    /// Positions of the receiving automata in the network
    pub receivers: Vec<usize>,
    /// Whether time may pass while the channel holds a message
    pub queued: bool,
}

impl Channel {
    /// Channels nobody uses are not part of the network
    pub fn is_used(&self) -> bool {
        !(self.senders.is_empty() && self.receivers.is_empty())
    }
}

/// All channels of a compilation, in order of first declaration
#[derive(Debug, Clone, Default)]
pub struct ChannelTable {
    channels: Vec<Channel>,
    by_name: FxHashMap<String, usize>,
}

impl ChannelTable {
    /// Registers a declared end point. Every end point of a channel must
    /// agree on the payload type and on the period.
    pub fn declare(&mut self, port: &Port) -> CompileResult<()> {
        match self.by_name.get(&port.channel) {
            None => {
                self.by_name
                    .insert(port.channel.clone(), self.channels.len());
                self.channels.push(Channel {
                    name: port.channel.clone(),
                    payload: port.payload.clone(),
                    period: port.period,
                    senders: vec![],
                    receivers: vec![],
                    queued: false,
                });
                Ok(())
            }
            Some(idx) => {
                let channel = &mut self.channels[*idx];
                if channel.payload.is_none() {
                    channel.payload = port.payload.clone();
                } else if port.payload.is_some() && channel.payload != port.payload {
                    let as_type = |p: &Option<String>| {
                        p.clone().map(Type::Struct).unwrap_or(Type::Bool)
                    };
                    return Err(TypeError::GlobalConflict {
                        name: channel.name.clone(),
                        first: as_type(&channel.payload),
                        second: as_type(&port.payload),
                    }
                    .into());
                }
                match (channel.period, port.period) {
                    (Some(a), Some(b)) if a != b => Err(StructuralError::InvalidTimer {
                        timer: channel.name.clone(),
                        details: format!("declared with periods of {}ns and {}ns", a, b),
                    }
                    .into()),
                    (None, Some(p)) => {
                        channel.period = Some(p);
                        Ok(())
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.by_name.get(name).map(|idx| &self.channels[*idx])
    }

    fn get_mut(&mut self, name: &str) -> CompileResult<&mut Channel> {
        match self.by_name.get(name) {
            Some(idx) => Ok(&mut self.channels[*idx]),
            None => Err(StructuralError::unknown_channel(name).into()),
        }
    }

    pub fn add_sender(&mut self, name: &str, automaton: usize) -> CompileResult<()> {
        let channel = self.get_mut(name)?;
        if !channel.senders.contains(&automaton) {
            channel.senders.push(automaton);
        }
        Ok(())
    }

    pub fn add_receiver(&mut self, name: &str, automaton: usize) -> CompileResult<()> {
        let channel = self.get_mut(name)?;
        if !channel.receivers.contains(&automaton) {
            channel.receivers.push(automaton);
        }
        Ok(())
    }

    /// Lets time pass while `name` holds a message
    pub fn queue(&mut self, name: &str) -> CompileResult<()> {
        self.get_mut(name)?.queued = true;
        Ok(())
    }

    /// Channels that end up in the network
    pub fn used(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter().filter(|c| c.is_used())
    }

    /// Used timer channels with their periods
    pub fn timers(&self) -> Vec<(&str, u64)> {
        self.used()
            .filter_map(|c| c.period.map(|p| (c.name.as_str(), p)))
            .collect()
    }
}

/// Builds the automaton that tracks whether `channel` holds a message.
/// Sends are only possible while it is `waiting`, receives only while it
/// is `received`. Without receivers the message is never taken, so a send
/// keeps the automaton in `waiting`. The clock only ticks while the
/// channel is empty, unless it is queued.
pub fn channel_automaton(channel: &Channel, clocked: bool) -> Automaton {
    let mut automaton = Automaton::new(channel.name.clone(), "waiting");
    let waiting = automaton.initial;
    let received = automaton.add_location("received", LocationKind::Original);
    if channel.receivers.is_empty() {
        automaton.edge(waiting, on_send(&channel.name), Expr::Bool(true), waiting, vec![]);
    } else {
        automaton.edge(waiting, on_send(&channel.name), Expr::Bool(true), received, vec![]);
        automaton.edge(received, on_receive(&channel.name), Expr::Bool(true), waiting, vec![]);
        if clocked {
            automaton.edge(waiting, CLOCK_ENABLE, Expr::Bool(true), waiting, vec![]);
            if channel.queued {
                automaton.edge(received, CLOCK_ENABLE, Expr::Bool(true), received, vec![]);
            }
        }
    }
    automaton
}

/// Synchronization vectors of a channel placed at position `position` in a
/// network of `size` automata: one per sender, and one that makes every
/// receiver take the message at once.
pub fn channel_syncs(channel: &Channel, position: usize, size: usize) -> Vec<SyncVector> {
    let mut out = vec![];
    let send = on_send(&channel.name);
    for sender in &channel.senders {
        let mut participants = vec![None; size];
        participants[position] = Some(send.clone());
        participants[*sender] = Some(send.clone());
        out.push(SyncVector {
            participants,
            result: send.clone(),
        });
    }
    if !channel.receivers.is_empty() {
        let receive = on_receive(&channel.name);
        let mut participants = vec![None; size];
        participants[position] = Some(receive.clone());
        for receiver in &channel.receivers {
            participants[*receiver] = Some(receive.clone());
        }
        out.push(SyncVector {
            participants,
            result: receive,
        });
    }
    out
}
