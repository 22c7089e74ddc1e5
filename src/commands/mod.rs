//! Command layer
//!
//! Parses one command line, checks the sender may run it and calls into the
//! engine. Every outcome is reported as a [`CommandOutcome`]; nothing here
//! returns an error.
//!
//! ```text
//! creategroup <group>            deletegroup <group>
//! createtrack <track>            deletetrack <track>
//! <scope> permission set <node> [true|false] [server] [world] [k=v..]
//! <scope> permission settemp <node> <true|false> <unix-expiry> [server] [world] [k=v..]
//! <scope> permission unset <node> [server] [world] [k=v..]
//! <scope> permission check <node> [server] [world] [k=v..]
//! <scope> parent add|remove <group> [server] [world]
//! <scope> meta set <key> <value> [server] [world]
//! <scope> meta setprefix|setsuffix <priority> <text> [server] [world]
//! group <group> setweight <weight>
//! user <uuid> switchprimarygroup <group>
//! user <uuid> promote|demote <track>
//! track <track> append|remove <group>
//! track <track> insert <group> <position>
//! track <track> clear
//! ```
//!
//! `<scope>` is `group <name>` or `user <uuid>`. A leading `/` and a leading
//! `permd` label are ignored.

use std::fmt;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::engine::{Engine, EngineError};
use crate::holder::{DataMutateResult, HolderRef, PermissionHolder};
use crate::node::{prefix_node, suffix_node, unix_now, Node, NodeBuilder, QueryContext};
use crate::track::TrackError;

/// Result tag of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandResult {
    Success,
    InvalidArgs,
    Failure,
    NoPermission,
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandResult::Success => f.write_str("SUCCESS"),
            CommandResult::InvalidArgs => f.write_str("INVALID_ARGS"),
            CommandResult::Failure => f.write_str("FAILURE"),
            CommandResult::NoPermission => f.write_str("NO_PERMISSION"),
        }
    }
}

/// Result tag plus a human-readable message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub result: CommandResult,
    pub detail: String,
}

impl CommandOutcome {
    pub fn success(detail: impl Into<String>) -> Self {
        Self::new(CommandResult::Success, detail)
    }

    pub fn invalid_args(detail: impl Into<String>) -> Self {
        Self::new(CommandResult::InvalidArgs, detail)
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self::new(CommandResult::Failure, detail)
    }

    pub fn new(result: CommandResult, detail: impl Into<String>) -> Self {
        Self {
            result,
            detail: detail.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result == CommandResult::Success
    }
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.result, self.detail)
    }
}

impl From<EngineError> for CommandOutcome {
    fn from(e: EngineError) -> Self {
        let result = match &e {
            EngineError::Storage(_)
            | EngineError::SaveFailed(_)
            | EngineError::UserNotLoaded(_)
            | EngineError::EndOfTrack(_, _)
            | EngineError::NotOnTrack(_, _)
            | EngineError::Track(TrackError::BrokenLink(_))
            | EngineError::Track(TrackError::AmbiguousPosition(_)) => CommandResult::Failure,
            _ => CommandResult::InvalidArgs,
        };
        Self::new(result, e.to_string())
    }
}

/// Who is running a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    /// Unrestricted
    Console,
    /// A loaded user, checked against `permd.<command>` permissions
    User(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Scope {
    Group(String),
    User(Uuid),
}

impl Scope {
    fn word(&self) -> &'static str {
        match self {
            Scope::Group(_) => "group",
            Scope::User(_) => "user",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HolderAction {
    PermissionSet(Node),
    PermissionUnset(Node),
    PermissionCheck(String, QueryContext),
    ParentAdd(String, Option<String>, Option<String>),
    ParentRemove(String, Option<String>, Option<String>),
    MetaSet(String, String, Option<String>, Option<String>),
    MetaSetPrefix(Node),
    MetaSetSuffix(Node),
    SetWeight(i32),
    SwitchPrimaryGroup(String),
    Promote(String),
    Demote(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TrackAction {
    Append(String),
    Remove(String),
    Insert(String, usize),
    Clear,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    CreateGroup(String),
    DeleteGroup(String),
    CreateTrack(String),
    DeleteTrack(String),
    Holder(Scope, HolderAction),
    Track(String, TrackAction),
}

impl Command {
    /// Permission a user sender needs, e.g. `permd.group.permission.set`
    fn permission(&self) -> String {
        let path = match self {
            Command::CreateGroup(_) => "creategroup".to_string(),
            Command::DeleteGroup(_) => "deletegroup".to_string(),
            Command::CreateTrack(_) => "createtrack".to_string(),
            Command::DeleteTrack(_) => "deletetrack".to_string(),
            Command::Holder(scope, action) => {
                let action = match action {
                    HolderAction::PermissionSet(node) if node.is_temporary() => "permission.settemp",
                    HolderAction::PermissionSet(_) => "permission.set",
                    HolderAction::PermissionUnset(_) => "permission.unset",
                    HolderAction::PermissionCheck(_, _) => "permission.check",
                    HolderAction::ParentAdd(..) => "parent.add",
                    HolderAction::ParentRemove(..) => "parent.remove",
                    HolderAction::MetaSet(..) => "meta.set",
                    HolderAction::MetaSetPrefix(_) => "meta.setprefix",
                    HolderAction::MetaSetSuffix(_) => "meta.setsuffix",
                    HolderAction::SetWeight(_) => "setweight",
                    HolderAction::SwitchPrimaryGroup(_) => "switchprimarygroup",
                    HolderAction::Promote(_) => "promote",
                    HolderAction::Demote(_) => "demote",
                };
                format!("{}.{}", scope.word(), action)
            }
            Command::Track(_, action) => match action {
                TrackAction::Append(_) => "track.append".to_string(),
                TrackAction::Remove(_) => "track.remove".to_string(),
                TrackAction::Insert(..) => "track.insert".to_string(),
                TrackAction::Clear => "track.clear".to_string(),
            },
        };
        format!("permd.{}", path)
    }
}

fn usage(text: &str) -> CommandOutcome {
    CommandOutcome::invalid_args(format!("usage: {}", text))
}

fn parse_bool(arg: &str) -> Option<bool> {
    match arg.to_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// Apply trailing `[server] [world] [k=v..]` arguments to a node builder
fn apply_scope<'a>(
    mut builder: NodeBuilder,
    args: impl Iterator<Item = &'a str>,
) -> Result<NodeBuilder, CommandOutcome> {
    let mut positional = 0;
    for arg in args {
        if let Some((k, v)) = arg.split_once('=') {
            builder = builder.context(k, v);
            continue;
        }
        builder = match positional {
            0 => builder.server(arg),
            1 => builder.world(arg),
            _ => return Err(CommandOutcome::invalid_args(format!("unexpected argument '{}'", arg))),
        };
        positional += 1;
    }
    Ok(builder)
}

fn parse_scope_args(args: &[&str]) -> Result<(Option<String>, Option<String>), CommandOutcome> {
    match args {
        [] => Ok((None, None)),
        [server] => Ok((Some(server.to_string()), None)),
        [server, world] => Ok((Some(server.to_string()), Some(world.to_string()))),
        _ => Err(CommandOutcome::invalid_args("too many arguments")),
    }
}

fn parse_holder_action(scope: &Scope, args: &[&str]) -> Result<HolderAction, CommandOutcome> {
    let sub: Vec<String> = args.iter().take(2).map(|a| a.to_lowercase()).collect();
    let sub: Vec<&str> = sub.iter().map(String::as_str).collect();

    match sub.as_slice() {
        ["permission", "set", ..] => {
            let rest = &args[2..];
            let Some(key) = rest.first() else {
                return Err(usage("permission set <node> [true|false] [server] [world]"));
            };
            let mut rest = rest[1..].iter().copied().peekable();
            let mut builder = Node::builder(key);
            if let Some(value) = rest.peek().and_then(|a| parse_bool(a)) {
                builder = builder.value(value);
                rest.next();
            }
            let node = apply_scope(builder, rest)?
                .build()
                .map_err(|e| CommandOutcome::invalid_args(e.to_string()))?;
            Ok(HolderAction::PermissionSet(node))
        }
        ["permission", "settemp", ..] => {
            let [key, value, expiry, rest @ ..] = &args[2..] else {
                return Err(usage(
                    "permission settemp <node> <true|false> <unix-expiry> [server] [world]",
                ));
            };
            let value = parse_bool(value)
                .ok_or_else(|| CommandOutcome::invalid_args(format!("'{}' is not true or false", value)))?;
            let expiry: i64 = expiry
                .parse()
                .map_err(|_| CommandOutcome::invalid_args(format!("invalid expiry '{}'", expiry)))?;
            if expiry <= unix_now() {
                return Err(CommandOutcome::invalid_args("expiry is in the past"));
            }
            let builder = Node::builder(key).value(value).expiry(expiry);
            let node = apply_scope(builder, rest.iter().copied())?
                .build()
                .map_err(|e| CommandOutcome::invalid_args(e.to_string()))?;
            Ok(HolderAction::PermissionSet(node))
        }
        ["permission", "unset", ..] => {
            let [key, rest @ ..] = &args[2..] else {
                return Err(usage("permission unset <node> [server] [world]"));
            };
            let node = apply_scope(Node::builder(key), rest.iter().copied())?
                .build()
                .map_err(|e| CommandOutcome::invalid_args(e.to_string()))?;
            Ok(HolderAction::PermissionUnset(node))
        }
        ["permission", "check", ..] => {
            let [key, rest @ ..] = &args[2..] else {
                return Err(usage("permission check <node> [server] [world]"));
            };
            let mut ctx = QueryContext::global();
            let mut positional = Vec::new();
            for arg in rest {
                match arg.split_once('=') {
                    Some((k, v)) => ctx = ctx.with_context(k, v),
                    None => positional.push(*arg),
                }
            }
            let (server, world) = parse_scope_args(&positional)?;
            let base = QueryContext::from_args(server.as_deref(), world.as_deref());
            ctx.server = base.server;
            ctx.world = base.world;
            Ok(HolderAction::PermissionCheck(key.to_string(), ctx))
        }
        ["parent", op @ ("add" | "remove"), ..] => {
            let [group, rest @ ..] = &args[2..] else {
                return Err(usage("parent add|remove <group> [server] [world]"));
            };
            let (server, world) = parse_scope_args(rest)?;
            let group = group.to_string();
            Ok(if *op == "add" {
                HolderAction::ParentAdd(group, server, world)
            } else {
                HolderAction::ParentRemove(group, server, world)
            })
        }
        ["meta", "set", ..] => {
            let [key, value, rest @ ..] = &args[2..] else {
                return Err(usage("meta set <key> <value> [server] [world]"));
            };
            let (server, world) = parse_scope_args(rest)?;
            Ok(HolderAction::MetaSet(key.to_string(), value.to_string(), server, world))
        }
        ["meta", op @ ("setprefix" | "setsuffix"), ..] => {
            let [priority, text, rest @ ..] = &args[2..] else {
                return Err(usage("meta setprefix|setsuffix <priority> <text> [server] [world]"));
            };
            let priority: i32 = priority
                .parse()
                .map_err(|_| CommandOutcome::invalid_args(format!("invalid priority '{}'", priority)))?;
            let (server, world) = parse_scope_args(rest)?;
            let node = if *op == "setprefix" {
                prefix_node(priority, text)
            } else {
                suffix_node(priority, text)
            };
            let node = node
                .and_then(|n| {
                    Node::builder(n.key())
                        .maybe_server(server.as_deref())
                        .maybe_world(world.as_deref())
                        .build()
                })
                .map_err(|e| CommandOutcome::invalid_args(e.to_string()))?;
            Ok(if *op == "setprefix" {
                HolderAction::MetaSetPrefix(node)
            } else {
                HolderAction::MetaSetSuffix(node)
            })
        }
        ["setweight", ..] if matches!(scope, Scope::Group(_)) => match args {
            [_, weight] => weight
                .parse()
                .map(HolderAction::SetWeight)
                .map_err(|_| CommandOutcome::invalid_args(format!("invalid weight '{}'", weight))),
            _ => Err(usage("group <group> setweight <weight>")),
        },
        ["switchprimarygroup", ..] if matches!(scope, Scope::User(_)) => match args {
            [_, group] => Ok(HolderAction::SwitchPrimaryGroup(group.to_string())),
            _ => Err(usage("user <uuid> switchprimarygroup <group>")),
        },
        [op @ ("promote" | "demote"), ..] if matches!(scope, Scope::User(_)) => match args {
            [_, track] if *op == "promote" => Ok(HolderAction::Promote(track.to_string())),
            [_, track] => Ok(HolderAction::Demote(track.to_string())),
            _ => Err(usage("user <uuid> promote|demote <track>")),
        },
        _ => Err(CommandOutcome::invalid_args(format!(
            "unknown {} command",
            scope.word()
        ))),
    }
}

fn parse_track_action(args: &[&str]) -> Result<TrackAction, CommandOutcome> {
    let op = args.first().map(|a| a.to_lowercase()).unwrap_or_default();
    match (op.as_str(), &args[args.len().min(1)..]) {
        ("append", [group]) => Ok(TrackAction::Append(group.to_string())),
        ("remove", [group]) => Ok(TrackAction::Remove(group.to_string())),
        ("clear", []) => Ok(TrackAction::Clear),
        ("insert", [group, position]) => {
            let position: usize = position
                .parse()
                .map_err(|_| CommandOutcome::invalid_args(format!("invalid position '{}'", position)))?;
            Ok(TrackAction::Insert(group.to_string(), position))
        }
        _ => Err(usage(
            "track <track> append|remove <group> | insert <group> <position> | clear",
        )),
    }
}

fn parse(line: &str) -> Result<Command, CommandOutcome> {
    let line = line.trim();
    let line = line.strip_prefix('/').unwrap_or(line);
    let mut args: Vec<&str> = line.split_whitespace().collect();
    if args.first().is_some_and(|a| a.eq_ignore_ascii_case("permd")) {
        args.remove(0);
    }
    let Some(first) = args.first() else {
        return Err(CommandOutcome::invalid_args("no command given"));
    };

    let label = first.to_lowercase();
    match (label.as_str(), &args[1..]) {
        ("creategroup", [name]) => Ok(Command::CreateGroup(name.to_string())),
        ("deletegroup", [name]) => Ok(Command::DeleteGroup(name.to_string())),
        ("createtrack", [name]) => Ok(Command::CreateTrack(name.to_string())),
        ("deletetrack", [name]) => Ok(Command::DeleteTrack(name.to_string())),
        ("creategroup" | "deletegroup" | "createtrack" | "deletetrack", _) => {
            Err(usage(&format!("{} <name>", label)))
        }
        ("group", [name, rest @ ..]) => {
            let scope = Scope::Group(name.to_lowercase());
            let action = parse_holder_action(&scope, rest)?;
            Ok(Command::Holder(scope, action))
        }
        ("user", [id, rest @ ..]) => {
            let uuid = Uuid::parse_str(id)
                .map_err(|_| CommandOutcome::invalid_args(format!("'{}' is not a valid UUID", id)))?;
            let scope = Scope::User(uuid);
            let action = parse_holder_action(&scope, rest)?;
            Ok(Command::Holder(scope, action))
        }
        ("track", [name, rest @ ..]) => {
            Ok(Command::Track(name.to_lowercase(), parse_track_action(rest)?))
        }
        _ => Err(CommandOutcome::invalid_args(format!("unknown command '{}'", label))),
    }
}

fn describe(result: DataMutateResult, holder: &str, node: &Node, verb: &str) -> CommandOutcome {
    match result {
        DataMutateResult::Success => CommandOutcome::success(format!("{} {} on {}", verb, node, holder)),
        DataMutateResult::AlreadyHas => {
            CommandOutcome::failure(format!("{} already has {}", holder, node))
        }
        DataMutateResult::LacksNode => {
            CommandOutcome::failure(format!("{} does not have {}", holder, node))
        }
    }
}

/// Runs command lines against an engine
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    engine: Arc<Engine>,
}

impl CommandExecutor {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub async fn execute(&self, sender: &Sender, line: &str) -> CommandOutcome {
        let command = match parse(line) {
            Ok(command) => command,
            Err(outcome) => return outcome,
        };

        if !self.may_run(sender, &command) {
            return CommandOutcome::new(
                CommandResult::NoPermission,
                format!("missing permission {}", command.permission()),
            );
        }

        let outcome = self.run(command).await;
        debug!("Command '{}' by {:?}: {}", line.trim(), sender, outcome);
        outcome
    }

    fn may_run(&self, sender: &Sender, command: &Command) -> bool {
        match sender {
            Sender::Console => true,
            Sender::User(uuid) => match self.engine.users().get(*uuid) {
                Some(user) => self
                    .engine
                    .has_permission(user.as_ref(), &command.permission(), &self.engine.server_context())
                    .as_bool_or(false),
                None => false,
            },
        }
    }

    async fn run(&self, command: Command) -> CommandOutcome {
        let engine = &self.engine;
        match command {
            Command::CreateGroup(name) => match engine.create_group(&name).await {
                Ok(group) => CommandOutcome::success(format!("created group {}", group.name())),
                Err(e) => e.into(),
            },
            Command::DeleteGroup(name) => match engine.delete_group(&name).await {
                Ok(()) => CommandOutcome::success(format!("deleted group {}", name.to_lowercase())),
                Err(e) => e.into(),
            },
            Command::CreateTrack(name) => match engine.create_track(&name).await {
                Ok(track) => CommandOutcome::success(format!("created track {}", track.name())),
                Err(e) => e.into(),
            },
            Command::DeleteTrack(name) => match engine.delete_track(&name).await {
                Ok(()) => CommandOutcome::success(format!("deleted track {}", name.to_lowercase())),
                Err(e) => e.into(),
            },
            Command::Track(name, action) => {
                let result = match &action {
                    TrackAction::Append(group) => engine.track_append(&name, group).await,
                    TrackAction::Remove(group) => engine.track_remove(&name, group).await,
                    TrackAction::Insert(group, pos) => engine.track_insert(&name, group, *pos).await,
                    TrackAction::Clear => engine.track_clear(&name).await,
                };
                match result {
                    Ok(()) => {
                        let groups = engine.tracks().get(&name).map(|t| t.groups()).unwrap_or_default();
                        CommandOutcome::success(format!("track {}: {}", name, groups.join(" -> ")))
                    }
                    Err(e) => e.into(),
                }
            }
            Command::Holder(scope, action) => self.run_holder(scope, action).await,
        }
    }

    async fn run_holder(&self, scope: Scope, action: HolderAction) -> CommandOutcome {
        let engine = &self.engine;
        let is_check = matches!(action, HolderAction::PermissionCheck(..));
        if let (Scope::User(uuid), true) = (&scope, is_check) {
            // checks read the stored user without loading or creating them
            let uuid = *uuid;
            return match engine.lookup_user(uuid).await {
                Ok(Some(user)) => self.apply(&HolderRef::User(user), action).await,
                Ok(None) => CommandOutcome::invalid_args(format!("unknown user {}", uuid)),
                Err(e) => e.into(),
            };
        }

        let holder = match &scope {
            Scope::Group(name) => match engine.group(name) {
                Ok(group) => HolderRef::Group(group),
                Err(e) => return e.into(),
            },
            Scope::User(uuid) => match engine.user(*uuid).await {
                Ok(user) => HolderRef::User(user),
                Err(e) => return e.into(),
            },
        };

        let outcome = self.apply(&holder, action).await;

        if let HolderRef::User(user) = &holder {
            engine.users().cleanup(user).await;
        }
        outcome
    }

    async fn apply(&self, holder: &HolderRef, action: HolderAction) -> CommandOutcome {
        let engine = &self.engine;
        let name = holder.as_holder().friendly_name();

        let result = match action {
            HolderAction::PermissionSet(node) => engine
                .set_node(holder, node.clone())
                .await
                .map(|r| describe(r, &name, &node, "set")),
            HolderAction::PermissionUnset(node) => engine
                .unset_node(holder, &node)
                .await
                .map(|r| describe(r, &name, &node, "unset")),
            HolderAction::PermissionCheck(key, ctx) => {
                let value = engine.has_permission(holder.as_holder(), &key, &ctx);
                Ok(CommandOutcome::success(format!("{} has {} = {} in {}", name, key, value, ctx)))
            }
            HolderAction::ParentAdd(group, server, world) => engine
                .add_parent(holder, &group, server.as_deref(), world.as_deref())
                .await
                .map(|r| match r {
                    DataMutateResult::Success => {
                        CommandOutcome::success(format!("{} now inherits {}", name, group))
                    }
                    _ => CommandOutcome::failure(format!("{} already inherits {}", name, group)),
                }),
            HolderAction::ParentRemove(group, server, world) => engine
                .remove_parent(holder, &group, server.as_deref(), world.as_deref())
                .await
                .map(|r| match r {
                    DataMutateResult::Success => {
                        CommandOutcome::success(format!("{} no longer inherits {}", name, group))
                    }
                    _ => CommandOutcome::failure(format!("{} does not inherit {}", name, group)),
                }),
            HolderAction::MetaSet(key, value, server, world) => engine
                .set_meta(holder, &key, &value, server.as_deref(), world.as_deref())
                .await
                .map(|r| match r {
                    DataMutateResult::Success => {
                        CommandOutcome::success(format!("set meta {}={} on {}", key, value, name))
                    }
                    _ => CommandOutcome::failure(format!("{} already has meta {}={}", name, key, value)),
                }),
            HolderAction::MetaSetPrefix(node) | HolderAction::MetaSetSuffix(node) => engine
                .set_node(holder, node.clone())
                .await
                .map(|r| describe(r, &name, &node, "set")),
            HolderAction::SetWeight(weight) => match holder {
                HolderRef::Group(group) => engine.set_weight(group, weight).await.map(|r| match r {
                    DataMutateResult::Success => {
                        CommandOutcome::success(format!("weight of {} is now {}", name, weight))
                    }
                    _ => CommandOutcome::failure(format!("{} already has weight {}", name, weight)),
                }),
                HolderRef::User(_) => Ok(CommandOutcome::invalid_args("users have no weight")),
            },
            HolderAction::SwitchPrimaryGroup(group) => match holder {
                HolderRef::User(user) => engine.set_primary_group(user, &group).await.map(|()| {
                    CommandOutcome::success(format!(
                        "primary group of {} is now {}",
                        name,
                        user.primary_group()
                    ))
                }),
                HolderRef::Group(_) => Ok(CommandOutcome::invalid_args("groups have no primary group")),
            },
            HolderAction::Promote(track) => match holder {
                HolderRef::User(user) => engine.promote(user, &track).await.map(|m| {
                    CommandOutcome::success(format!("promoted {} from {} to {}", name, m.from, m.to))
                }),
                HolderRef::Group(_) => Ok(CommandOutcome::invalid_args("only users can be promoted")),
            },
            HolderAction::Demote(track) => match holder {
                HolderRef::User(user) => engine.demote(user, &track).await.map(|m| {
                    CommandOutcome::success(format!("demoted {} from {} to {}", name, m.from, m.to))
                }),
                HolderRef::Group(_) => Ok(CommandOutcome::invalid_args("only users can be demoted")),
            },
        };

        result.unwrap_or_else(CommandOutcome::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, Storage};
    use crate::Config;

    async fn executor() -> CommandExecutor {
        let engine = Engine::new(Config::default(), Arc::new(MemoryStorage::new()));
        engine.start().await.unwrap();
        CommandExecutor::new(Arc::new(engine))
    }

    #[test]
    fn test_parse_tolerates_label_and_slash() {
        assert_eq!(
            parse("/permd creategroup Admin"),
            Ok(Command::CreateGroup("Admin".to_string()))
        );
        assert_eq!(parse("creategroup admin"), parse("permd creategroup admin"));
        assert!(parse("   ").is_err());
    }

    #[test]
    fn test_parse_permission_set_arguments() {
        let cmd = parse("group admin permission set fly false survival nether region=spawn").unwrap();
        let expected: Node = "(region=spawn)survival-nether/-fly".parse().unwrap();
        assert_eq!(
            cmd,
            Command::Holder(
                Scope::Group("admin".into()),
                HolderAction::PermissionSet(expected)
            )
        );
        assert_eq!(cmd.permission(), "permd.group.permission.set");

        let extra = parse("group admin permission set fly true a b c");
        assert_eq!(extra.unwrap_err().result, CommandResult::InvalidArgs);
    }

    #[test]
    fn test_parse_settemp_requires_future_expiry() {
        let past = parse("group admin permission settemp fly true 100");
        assert_eq!(past.unwrap_err().result, CommandResult::InvalidArgs);

        let line = format!("group admin permission settemp fly true {}", unix_now() + 3600);
        let cmd = parse(&line).unwrap();
        assert_eq!(cmd.permission(), "permd.group.permission.settemp");
    }

    #[test]
    fn test_user_only_subcommands() {
        assert!(parse("group admin promote staff").is_err());
        let uuid = Uuid::new_v4();
        assert_eq!(
            parse(&format!("user {} promote staff", uuid)).unwrap().permission(),
            "permd.user.promote"
        );
        assert!(parse("user not-a-uuid promote staff").is_err());
    }

    #[tokio::test]
    async fn test_console_runs_everything() {
        let exec = executor().await;
        let console = Sender::Console;

        assert!(exec.execute(&console, "creategroup admin").await.is_success());
        let dup = exec.execute(&console, "creategroup admin").await;
        assert_eq!(dup.result, CommandResult::InvalidArgs);

        assert!(exec
            .execute(&console, "group admin permission set essentials.*")
            .await
            .is_success());
        let again = exec
            .execute(&console, "group admin permission set essentials.*")
            .await;
        assert_eq!(again.result, CommandResult::Failure);

        let check = exec
            .execute(&console, "group admin permission check essentials.home")
            .await;
        assert!(check.detail.contains("= true"), "{}", check.detail);
    }

    #[tokio::test]
    async fn test_user_sender_needs_permission() {
        let exec = executor().await;
        let uuid = Uuid::new_v4();
        assert!(exec.engine().users().load_or_create_user(uuid, Some("alice")).await);
        exec.engine().users().get(uuid).unwrap().set_online(true);
        let sender = Sender::User(uuid);

        let denied = exec.execute(&sender, "creategroup vip").await;
        assert_eq!(denied.result, CommandResult::NoPermission);

        let grant = format!("user {} permission set permd.creategroup", uuid);
        assert!(exec.execute(&Sender::Console, &grant).await.is_success());
        assert!(exec.execute(&sender, "creategroup vip").await.is_success());

        let unknown = exec.execute(&Sender::User(Uuid::new_v4()), "creategroup x").await;
        assert_eq!(unknown.result, CommandResult::NoPermission);
    }

    #[tokio::test]
    async fn test_unknown_group_is_invalid_args() {
        let exec = executor().await;
        let outcome = exec
            .execute(&Sender::Console, "group ghost permission set a.b")
            .await;
        assert_eq!(outcome.result, CommandResult::InvalidArgs);
        assert!(outcome.detail.contains("ghost"));
    }

    #[tokio::test]
    async fn test_offline_user_is_released_after_command() {
        let exec = executor().await;
        let uuid = Uuid::new_v4();
        let line = format!("user {} permission set some.perm", uuid);

        assert!(exec.execute(&Sender::Console, &line).await.is_success());
        assert!(!exec.engine().users().is_loaded(uuid));

        let stored = exec.engine().storage().load_user(uuid).await.unwrap().unwrap();
        assert!(stored.nodes.contains(&"some.perm".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_weight_node_must_be_a_number() {
        let exec = executor().await;
        for line in [
            "group default permission set weight.abc",
            "group default permission set weight.99999999999",
        ] {
            let outcome = exec.execute(&Sender::Console, line).await;
            assert_eq!(outcome.result, CommandResult::InvalidArgs, "{}", line);
        }
        assert!(exec.engine().group("default").unwrap().nodes().is_empty());
    }

    #[tokio::test]
    async fn test_chat_meta_and_weight_commands() {
        let exec = executor().await;
        let console = Sender::Console;
        assert!(exec.execute(&console, "creategroup admin").await.is_success());

        let cmd = parse("group admin meta setprefix 10 [Admin] survival").unwrap();
        assert_eq!(cmd.permission(), "permd.group.meta.setprefix");
        assert!(exec.execute(&console, "group admin meta setprefix 10 [Admin] survival").await.is_success());
        assert!(exec.execute(&console, "group admin meta setsuffix 1 *").await.is_success());
        let bad = exec.execute(&console, "group admin meta setprefix high [Admin]").await;
        assert_eq!(bad.result, CommandResult::InvalidArgs);

        let admin = exec.engine().group("admin").unwrap();
        let survival = QueryContext::server("survival");
        assert_eq!(exec.engine().get_prefix(admin.as_ref(), &survival).as_deref(), Some("[Admin]"));
        assert_eq!(exec.engine().get_prefix(admin.as_ref(), &QueryContext::global()), None);
        assert_eq!(exec.engine().get_suffix(admin.as_ref(), &survival).as_deref(), Some("*"));

        assert!(exec.execute(&console, "group admin setweight 5").await.is_success());
        assert!(exec.execute(&console, "group admin setweight 7").await.is_success());
        assert_eq!(admin.weight(), 7);
        let weights = admin.nodes().iter().filter(|n| n.weight().is_some()).count();
        assert_eq!(weights, 1);

        let again = exec.execute(&console, "group admin setweight 7").await;
        assert_eq!(again.result, CommandResult::Failure);
        assert!(parse(&format!("user {} setweight 5", Uuid::new_v4())).is_err());
    }

    #[tokio::test]
    async fn test_track_clear_command() {
        let exec = executor().await;
        let console = Sender::Console;
        for line in ["creategroup a", "createtrack ladder", "track ladder append a"] {
            assert!(exec.execute(&console, line).await.is_success(), "{}", line);
        }
        assert_eq!(parse("track ladder clear").unwrap().permission(), "permd.track.clear");

        assert!(exec.execute(&console, "track ladder clear").await.is_success());
        assert!(exec.engine().track("ladder").unwrap().groups().is_empty());
        let stored = exec.engine().storage().load_all_tracks().await.unwrap();
        assert!(stored.iter().any(|t| t.name == "ladder" && t.groups.is_empty()));
    }

    #[tokio::test]
    async fn test_check_does_not_create_unknown_users() {
        let exec = executor().await;
        let uuid = Uuid::new_v4();
        let line = format!("user {} permission check some.perm", uuid);

        let outcome = exec.execute(&Sender::Console, &line).await;
        assert_eq!(outcome.result, CommandResult::InvalidArgs);
        assert!(!exec.engine().users().is_loaded(uuid));
        assert!(exec.engine().storage().load_user(uuid).await.unwrap().is_none());

        let grant = format!("user {} permission set some.perm", uuid);
        assert!(exec.execute(&Sender::Console, &grant).await.is_success());
        let outcome = exec.execute(&Sender::Console, &line).await;
        assert!(outcome.detail.contains("= true"), "{}", outcome.detail);
        assert!(!exec.engine().users().is_loaded(uuid));
    }
}
