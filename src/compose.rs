// Copyright 2025 Cornell University
// released under MIT License

//! Turns a project into one composed network.
//!
//! Positions in the network are fixed by declaration order: user automata,
//! behavior tree automata, service and action handlers, channel automata
//! (in order of first channel declaration) and finally the clock. Globals
//! follow the same order.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::bt::{self, BLACKBOARD, BLACKBOARD_FSM};
use crate::channels::{channel_automaton, channel_syncs, valid_flag, ChannelTable};
use crate::clock::{tick_sync, Clock};
use crate::config::Config;
use crate::errors::{CompileResult, StructuralError, TypeError, WithContext};
use crate::eval::Value;
use crate::explore::evaluate;
use crate::flatten::{flatten, out_of_bounds_flag, Flattened};
use crate::handlers;
use crate::model::{Project, Scope, StateMachine, Variable};
use crate::network::{ComposedNetwork, Expr, LValue, SyncVector, VarDecl};
use crate::ros::Port;
use crate::translate::{default_expr, Binding, StringTable, Translator};
use crate::types::{StructRegistry, Type};

/// A composed network with the string literals it interns
#[derive(Debug, Clone, PartialEq)]
pub struct Compiled {
    pub network: ComposedNetwork,
    /// Interned strings ordered by id
    pub strings: Vec<(i64, String)>,
}

/// A global declared by one or more automata
struct Shared<'p> {
    name: String,
    tpe: Type,
    init: Option<&'p str>,
}

pub fn compose(project: &Project, config: &Config) -> CompileResult<Compiled> {
    let instantiated = bt::instantiate(&project.trees, &project.plugins, config)?;
    let mut structs = project.structs.clone();
    for def in &instantiated.structs {
        if !structs.add(def.clone()) {
            return Err(StructuralError::DuplicateStruct {
                name: def.name().to_string(),
            }
            .into());
        }
    }
    let declared: Vec<&StateMachine> = project
        .automata
        .iter()
        .chain(&instantiated.automata)
        .collect();
    let handlers = handlers::build(&declared, &structs)?;
    let machines: Vec<&StateMachine> = declared
        .into_iter()
        .chain(&handlers.automata)
        .collect();
    let mut seen = FxHashSet::default();
    for sm in &machines {
        if !seen.insert(sm.name.as_str()) {
            return Err(StructuralError::DuplicateAutomaton {
                name: sm.name.clone(),
            }
            .into());
        }
    }
    log::info!(
        "composing {} automata ({} from behavior trees, {} handlers)",
        machines.len(),
        instantiated.automata.len(),
        handlers.automata.len()
    );

    let mut table = ChannelTable::default();
    let mut ports: Vec<Vec<Port>> = vec![];
    for sm in &machines {
        let own = declared_ports(sm, &structs, &mut table).in_automaton(&sm.name)?;
        ports.push(own);
    }
    for channel in &handlers.queued {
        table.queue(channel)?;
    }

    // globals shared between automata
    let mut shared: Vec<Shared> = vec![];
    for sm in &machines {
        for var in sm.variables.iter().filter(|v| v.scope == Scope::Global) {
            structs.check(&var.tpe).in_automaton(&sm.name)?;
            share(&mut shared, &var.name, &var.tpe, var.init.as_deref())?;
        }
    }
    if let Some(tpe) = instantiated.blackboard_type() {
        share(&mut shared, BLACKBOARD, &tpe, None)?;
    }
    let bindings: FxHashMap<String, Binding> = shared
        .iter()
        .map(|g| {
            let writable = g.name != BLACKBOARD;
            (g.name.clone(), Binding::stored(g.name.clone(), g.tpe.clone(), writable))
        })
        .collect();

    let mut strings = StringTable::default();
    let mut globals = vec![];
    for g in &shared {
        globals.extend(leaf_decls(&structs, &g.name, &g.tpe)?);
    }
    {
        let mut tr = Translator::new(&structs, &bindings, &mut strings);
        let mut writes = vec![];
        for g in &shared {
            if let Some(init) = g.init {
                writes.extend(tr.store_into(&g.name, &g.tpe, init)?);
            }
        }
        for entry in &instantiated.blackboard {
            if let Some(init) = &entry.init {
                let path = format!("{}.{}", BLACKBOARD, entry.key);
                writes.extend(tr.store_into(&path, &entry.tpe, init)?);
            }
        }
        solve_inits(&mut globals, writes, &|_| None)?;
    }

    let mut flattened: Vec<Flattened> = vec![];
    let mut checked: Vec<String> = vec![];
    for (pos, sm) in machines.iter().enumerate() {
        let (out, has_checks) = compile_machine(
            sm,
            &structs,
            &bindings,
            &mut strings,
            &table,
            &ports[pos],
            &globals,
        )
        .in_automaton(&sm.name)?;
        for channel in &out.receives {
            table.add_receiver(channel, pos)?;
        }
        for channel in &out.sends {
            table.add_sender(channel, pos)?;
        }
        if has_checks {
            checked.push(out_of_bounds_flag(&sm.name));
        }
        flattened.push(out);
    }

    let n = flattened.len();
    let timers: Vec<(String, u64)> = table
        .timers()
        .into_iter()
        .map(|(name, period)| (name.to_string(), period))
        .collect();
    let timer_refs: Vec<(&str, u64)> = timers.iter().map(|(c, p)| (c.as_str(), *p)).collect();
    let clock = Clock::new(&timer_refs, &config.max_time);
    let num_channels = table.used().count();
    let clock_pos = n + num_channels;
    if clock.is_some() {
        for (channel, _) in &timers {
            table.add_sender(channel, clock_pos)?;
        }
    }
    let size = clock_pos + usize::from(clock.is_some());

    let mut automata: Vec<_> = flattened.into_iter().map(|f| f.automaton).collect();
    let mut syncs: Vec<SyncVector> = vec![];
    let mut gated = vec![];
    for (k, channel) in table.used().enumerate() {
        automata.push(channel_automaton(channel, clock.is_some()));
        syncs.extend(channel_syncs(channel, n + k, size));
        if !channel.receivers.is_empty() {
            gated.push(n + k);
        }
        if let Some(payload) = &channel.payload {
            globals.extend(leaf_decls(&structs, &channel.name, &Type::Struct(payload.clone()))?);
            globals.push(VarDecl {
                name: valid_flag(&channel.name),
                tpe: Type::Bool,
                init: Value::Bool(false),
            });
        }
    }
    for flag in checked {
        globals.push(VarDecl {
            name: flag,
            tpe: Type::Bool,
            init: Value::Bool(false),
        });
    }
    if let Some(clock) = &clock {
        automata.push(clock.automaton());
        syncs.push(tick_sync(clock_pos, &gated, size));
        globals.extend(clock.globals());
    }

    let mut names = FxHashSet::default();
    for a in &automata {
        if !names.insert(a.name.as_str()) {
            return Err(StructuralError::DuplicateAutomaton {
                name: a.name.clone(),
            }
            .into());
        }
    }
    let mut global_names = FxHashSet::default();
    for g in &globals {
        if !global_names.insert(g.name.as_str()) {
            return Err(StructuralError::DuplicateVariable {
                name: g.name.clone(),
            }
            .into());
        }
    }

    // every label not bound by a channel or the clock fires alone
    let mut covered: Vec<FxHashSet<&str>> = vec![FxHashSet::default(); size];
    for sync in &syncs {
        for (i, label) in sync.participants.iter().enumerate() {
            if let Some(label) = label {
                covered[i].insert(label.as_str());
            }
        }
    }
    let mut singletons = vec![];
    for (i, automaton) in automata.iter().enumerate() {
        for action in automaton.actions() {
            if !covered[i].contains(action) {
                let mut participants = vec![None; size];
                participants[i] = Some(action.to_string());
                singletons.push(SyncVector {
                    participants,
                    result: action.to_string(),
                });
            }
        }
    }
    syncs.extend(singletons);

    for property in &project.properties {
        property.check_names(|name| global_names.contains(name))?;
    }

    log::info!(
        "network: {} automata, {} channels, {} timers, {} globals, {} sync vectors",
        automata.len(),
        num_channels,
        timers.len(),
        globals.len(),
        syncs.len()
    );
    let network = ComposedNetwork {
        globals,
        automata,
        syncs,
        properties: project.properties.clone(),
        time_unit: clock.map(|c| c.unit),
    };
    let strings = strings
        .entries()
        .into_iter()
        .map(|(id, s)| (id, s.to_string()))
        .collect();
    Ok(Compiled { network, strings })
}

fn declared_ports(
    sm: &StateMachine,
    structs: &StructRegistry,
    table: &mut ChannelTable,
) -> CompileResult<Vec<Port>> {
    let mut own = vec![];
    for decl in &sm.declarations {
        own.extend(decl.ports(&sm.name)?);
    }
    own.extend(bt::implied_ports(sm));
    for port in &own {
        if let Some(payload) = &port.payload {
            structs.check(&Type::Struct(payload.clone()))?;
        }
        table.declare(port)?;
    }
    Ok(own)
}

fn share<'p>(
    shared: &mut Vec<Shared<'p>>,
    name: &str,
    tpe: &Type,
    init: Option<&'p str>,
) -> CompileResult<()> {
    match shared.iter().find(|g| g.name == name) {
        Some(first) if &first.tpe != tpe => Err(TypeError::GlobalConflict {
            name: name.to_string(),
            first: first.tpe.clone(),
            second: tpe.clone(),
        }
        .into()),
        Some(_) => Ok(()),
        None => {
            shared.push(Shared {
                name: name.to_string(),
                tpe: tpe.clone(),
                init,
            });
            Ok(())
        }
    }
}

/// Flattens one automaton and computes the initial values of its locals.
/// Also returns whether any of its accesses is checked at run time.
fn compile_machine(
    sm: &StateMachine,
    structs: &StructRegistry,
    bindings: &FxHashMap<String, Binding>,
    strings: &mut StringTable,
    table: &ChannelTable,
    ports: &[Port],
    globals: &[VarDecl],
) -> CompileResult<(Flattened, bool)> {
    sm.check_structure()?;
    let locals: Vec<&Variable> = sm
        .variables
        .iter()
        .filter(|v| v.scope == Scope::Local)
        .collect();
    for var in &locals {
        structs.check(&var.tpe)?;
        if bindings.contains_key(&var.name) {
            return Err(StructuralError::ShadowedGlobal {
                name: var.name.clone(),
            }
            .into());
        }
    }
    let mut variables = vec![];
    for var in &locals {
        variables.extend(leaf_decls(structs, &var.name, &var.tpe)?);
    }
    let writes = {
        let mut tr = Translator::new(structs, bindings, strings);
        bind_names(sm, &locals, bindings, &mut tr)?;
        let mut writes = vec![];
        for var in &locals {
            if let Some(init) = &var.init {
                writes.extend(tr.store_into(&var.name, &var.tpe, init)?);
            }
        }
        writes
    };
    let global_values: FxHashMap<&str, &Value> =
        globals.iter().map(|g| (g.name.as_str(), &g.init)).collect();
    solve_inits(&mut variables, writes, &|name| {
        global_values.get(name).map(|v| (*v).clone())
    })?;

    let mut tr = Translator::new(structs, bindings, strings);
    bind_names(sm, &locals, bindings, &mut tr)?;
    let mut out = flatten(sm, &mut tr, table, ports)?;
    out.automaton.variables = variables;
    Ok((out, tr.has_checks()))
}

fn bind_names(
    sm: &StateMachine,
    locals: &[&Variable],
    bindings: &FxHashMap<String, Binding>,
    tr: &mut Translator,
) -> CompileResult<()> {
    for var in locals {
        tr.bind_local(
            &var.name,
            Binding::stored(var.name.clone(), var.tpe.clone(), true),
        );
    }
    // the blackboard automaton is the only writer of the blackboard
    if sm.name == BLACKBOARD_FSM {
        if let Some(Binding::Stored { tpe, .. }) = bindings.get(BLACKBOARD) {
            tr.bind_local(BLACKBOARD, Binding::stored(BLACKBOARD, tpe.clone(), true));
        }
    }
    bt::bind_ports(sm, tr)
}

/// Strings are stored as their interned ids
fn network_type(tpe: &Type) -> Type {
    match tpe {
        Type::Str => Type::int32(),
        Type::Array {
            elem,
            bound,
            dynamic,
        } => Type::Array {
            elem: Box::new(network_type(elem)),
            bound: *bound,
            dynamic: *dynamic,
        },
        other => other.clone(),
    }
}

/// Declarations of the leaves of `path`, holding their default values
fn leaf_decls(structs: &StructRegistry, path: &str, tpe: &Type) -> CompileResult<Vec<VarDecl>> {
    let mut out = vec![];
    for leaf in structs.leaves(path, tpe)? {
        let init = evaluate(&default_expr(&leaf.tpe), &|_| None)
            .map_err(|e| TypeError::mismatch("default value", e.to_string()))?;
        out.push(VarDecl {
            name: leaf.path,
            tpe: network_type(&leaf.tpe),
            init,
        });
    }
    Ok(out)
}

/// Evaluates initial value writes in dependency order. A write runs once no
/// pending write targets any variable it reads; reads fall back to `outer`
/// for variables not in `decls`.
fn solve_inits(
    decls: &mut [VarDecl],
    writes: Vec<(LValue, Expr)>,
    outer: &dyn Fn(&str) -> Option<Value>,
) -> CompileResult<()> {
    let mut pending = writes;
    while !pending.is_empty() {
        let targets: FxHashSet<String> = pending.iter().map(|(lv, _)| lv.name.clone()).collect();
        let ready = pending.iter().position(|(lv, value)| {
            lv.indices
                .iter()
                .flat_map(|i| i.variables())
                .chain(value.variables())
                .all(|v| !targets.contains(v))
        });
        let Some(ready) = ready else {
            let mut cycle: Vec<String> = vec![];
            for (lv, _) in &pending {
                if !cycle.contains(&lv.name) {
                    cycle.push(lv.name.clone());
                }
            }
            return Err(StructuralError::CyclicDefault { cycle }.into());
        };
        let (target, value) = pending.remove(ready);
        let lookup = |name: &str| {
            decls
                .iter()
                .find(|d| d.name == name)
                .map(|d| d.init.clone())
                .or_else(|| outer(name))
        };
        let fail = |e: crate::eval::EvalError| {
            TypeError::mismatch("initial value", format!("`{}`: {}", target, e))
        };
        let value = evaluate(&value, &lookup).map_err(fail)?;
        let indices = target
            .indices
            .iter()
            .map(|i| evaluate(i, &lookup).map_err(fail))
            .collect::<Result<Vec<_>, _>>()?;
        let decl = decls
            .iter_mut()
            .find(|d| d.name == target.name)
            .ok_or_else(|| StructuralError::unresolved(&target.name))?;
        let mut slot = &mut decl.init;
        for idx in indices {
            let i = idx.as_int().unwrap_or(-1);
            slot = match slot {
                Value::Array(items) if i >= 0 && (i as usize) < items.len() => &mut items[i as usize],
                _ => {
                    return Err(TypeError::mismatch(
                        "initial value",
                        format!("index {} of `{}` is out of range", idx, target.name),
                    )
                    .into())
                }
            };
        }
        *slot = value;
    }
    Ok(())
}
