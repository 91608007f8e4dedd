//! The interactive debugger.
//!
//! A minimal REPL driven from the inspector hook: execution pauses before
//! each instruction while stepping, and commands resolve through a prefix
//! trie so unambiguous abbreviations work.
use std::io::{self, BufRead, Write};

use spvsim_exec::error::Result;
use spvsim_exec::program::{Inspector, StepState};

use crate::trie::Trie;

const COMMANDS: [(&str, u32); 8] = [
    ("at", 0),
    ("help", 1),
    ("next", 2),
    ("print", 3),
    ("quit", 4),
    ("run", 5),
    ("stack", 6),
    ("step", 7),
];

enum Mode {
    /// Stop before each of the next `n` instructions.
    Stepping(u64),
    /// Run to completion without stopping.
    Running,
}

pub struct Debugger {
    commands: Trie,
    mode: Mode,
}

impl Debugger {
    pub fn new() -> Debugger {
        let mut commands = Trie::new();
        for (name, id) in COMMANDS {
            commands.insert(name, id);
        }
        Debugger {
            commands,
            mode: Mode::Stepping(1),
        }
    }

    fn prompt(&mut self, state: &StepState, invocation: usize, pc: usize, desc: &str) -> Result<()> {
        let stdin = io::stdin();
        loop {
            print!("(spvsim) ");
            io::stdout().flush().ok();
            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 {
                // End of input behaves like `run`.
                self.mode = Mode::Running;
                return Ok(());
            }
            let mut words = line.split_whitespace();
            let head = match words.next() {
                Some(word) => word,
                None => continue,
            };

            let command = match self.commands.next(head) {
                Some((node, _)) if node.has_value() => node.value().unwrap(),
                Some(_) => {
                    let options: Vec<String> = self
                        .commands
                        .enumerate()
                        .into_iter()
                        .filter(|k| k.starts_with(head))
                        .collect();
                    println!("ambiguous command; candidates: {}", options.join(", "));
                    continue;
                }
                None => {
                    println!("unknown command \"{}\"; try help", head);
                    continue;
                }
            };

            match command {
                // at
                0 => println!("[{}] @{}: {}", invocation, pc, desc),
                // help
                1 => {
                    println!("at            show the current instruction");
                    println!("help          print this help");
                    println!("next          execute one instruction");
                    println!("print [name]  show one interface variable, or all");
                    println!("quit          abandon execution");
                    println!("run           continue to the end");
                    println!("stack         show the call stack depth");
                    println!("step [n]      execute n instructions (default 1)");
                }
                // next
                2 => {
                    self.mode = Mode::Stepping(1);
                    return Ok(());
                }
                // print
                3 => match words.next() {
                    Some(name) => match state.variable(name) {
                        Some(rendered) => println!("{} = {}", name, rendered),
                        None => println!("no interface variable named \"{}\"", name),
                    },
                    None => {
                        for (name, rendered) in state.variables() {
                            println!("{} = {}", name, rendered);
                        }
                    }
                },
                // quit
                4 => std::process::exit(0),
                // run
                5 => {
                    self.mode = Mode::Running;
                    return Ok(());
                }
                // stack
                6 => println!("stack depth: {}", state.stack_depth()),
                // step
                7 => {
                    let n = words.next().and_then(|w| w.parse().ok()).unwrap_or(1);
                    self.mode = Mode::Stepping(n.max(1));
                    return Ok(());
                }
                _ => unreachable!(),
            }
        }
    }
}

impl Inspector for Debugger {
    fn before_step(
        &mut self,
        state: &StepState,
        invocation: usize,
        pc: usize,
        desc: &str,
    ) -> Result<()> {
        match &mut self.mode {
            Mode::Running => Ok(()),
            Mode::Stepping(n) => {
                *n -= 1;
                if *n == 0 {
                    self.prompt(state, invocation, pc, desc)
                } else {
                    Ok(())
                }
            }
        }
    }
}

impl Default for Debugger {
    fn default() -> Self {
        Self::new()
    }
}
