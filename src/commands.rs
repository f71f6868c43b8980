//! Command table and the built-in command set.
//!
//! Commands are stateless capabilities keyed by their exact,
//! case-sensitive name. The core consumes the table through `get`; the
//! set itself is supplied from outside (main registers the built-ins)
//! and can be extended with `register`.

use crate::copyover;
use crate::server::Server;
use crate::session::Session;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// A named command invoked with the calling session and its arguments.
#[async_trait]
pub trait Command: Send + Sync {
    async fn act(&self, server: &Arc<Server>, session: &Arc<Session>, args: &[&str]);
}

/// Name → command lookup table.
pub struct CommandTable {
    commands: HashMap<&'static str, Box<dyn Command>>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self {
            commands: HashMap::new(),
        }
    }

    /// The reference command set: echo, quit, copyover.
    pub fn builtin() -> Self {
        let mut table = Self::new();
        table.register("echo", Box::new(Echo));
        table.register("quit", Box::new(Quit));
        table.register("copyover", Box::new(Copyover));
        table
    }

    pub fn register(&mut self, name: &'static str, command: Box<dyn Command>) {
        self.commands.insert(name, command);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Command> {
        self.commands.get(name).map(|c| c.as_ref())
    }
}

/// Writes the joined arguments back, newline-terminated.
struct Echo;

#[async_trait]
impl Command for Echo {
    async fn act(&self, _server: &Arc<Server>, session: &Arc<Session>, args: &[&str]) {
        if !args.is_empty() {
            session.write_str(&format!("{}\n", args.join(" "))).await;
        }
    }
}

/// Says farewell and closes the session.
struct Quit;

#[async_trait]
impl Command for Quit {
    async fn act(&self, _server: &Arc<Server>, session: &Arc<Session>, _args: &[&str]) {
        session.write_str("You have left\n").await;
        session.close();
    }
}

/// Hands the listener and every live client to a fresh process image.
struct Copyover;

#[async_trait]
impl Command for Copyover {
    async fn act(&self, server: &Arc<Server>, _session: &Arc<Session>, _args: &[&str]) {
        copyover::initiate(server).await;
    }
}
