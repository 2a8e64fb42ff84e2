//! In-process RESP server for integration tests.
//!
//! Understands the handful of commands the client library issues, keeps data
//! per database in memory and records every request it receives.

#![allow(dead_code)]

use bytes::Bytes;
use redshard::io::{InputBuffer, OutputBuffer};
use redshard::protocol::{read_reply, write_reply};
use redshard::RespValue;
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Value {
    Str(Vec<u8>),
    List(VecDeque<Vec<u8>>),
}

#[derive(Default)]
struct Shared {
    data: Mutex<HashMap<(i64, Vec<u8>), Value>>,
    ttl: Mutex<HashMap<(i64, Vec<u8>), i64>>,
    log: Mutex<Vec<Vec<String>>>,
    password: Option<String>,
    connections: AtomicUsize,
    /// How long BLPOP/BRPOP on an empty list waits before answering nil.
    block_for: Duration,
}

pub struct FakeServer {
    pub port: u16,
    shared: Arc<Shared>,
}

impl FakeServer {
    pub fn start() -> Self {
        Self::launch(Shared {
            block_for: Duration::from_millis(300),
            ..Shared::default()
        })
    }

    pub fn with_password(password: &str) -> Self {
        Self::launch(Shared {
            password: Some(password.to_string()),
            block_for: Duration::from_millis(300),
            ..Shared::default()
        })
    }

    fn launch(shared: Shared) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let shared = Arc::new(shared);

        let accept_shared = shared.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                accept_shared.connections.fetch_add(1, Ordering::SeqCst);
                let shared = accept_shared.clone();
                thread::spawn(move || serve(stream, shared));
            }
        });

        Self { port, shared }
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Every request seen, as upper-cased command followed by its arguments.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.shared.log.lock().unwrap().clone()
    }

    pub fn count_of(&self, command: &str) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.first().map(String::as_str) == Some(command))
            .count()
    }

    pub fn key_count(&self) -> usize {
        self.shared.data.lock().unwrap().len()
    }

    pub fn contains(&self, db: i64, key: &str) -> bool {
        self.shared
            .data
            .lock()
            .unwrap()
            .contains_key(&(db, key.as_bytes().to_vec()))
    }
}

/// Listener that accepts one connection and closes it straight away.
pub fn hang_up_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    thread::spawn(move || {
        if let Ok((stream, _)) = listener.accept() {
            drop(stream);
        }
    });
    port
}

/// Port with nothing listening on it.
pub fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    port
}

struct Session {
    db: i64,
    authed: bool,
}

fn serve(stream: TcpStream, shared: Arc<Shared>) {
    let mut input = InputBuffer::new(stream.try_clone().expect("clone"));
    let mut output = OutputBuffer::new(stream);
    let mut session = Session {
        db: 0,
        authed: shared.password.is_none(),
    };

    while let Ok(request) = read_reply(&mut input) {
        let args = match request {
            RespValue::Array(Some(items)) => items
                .into_iter()
                .map(|item| match item {
                    RespValue::BulkString(Some(b)) => b.to_vec(),
                    _ => Vec::new(),
                })
                .collect::<Vec<_>>(),
            _ => break,
        };
        if args.is_empty() {
            break;
        }

        let name = String::from_utf8_lossy(&args[0]).to_uppercase();
        shared.log.lock().unwrap().push(
            std::iter::once(name.clone())
                .chain(args[1..].iter().map(|a| String::from_utf8_lossy(a).into_owned()))
                .collect(),
        );

        let quit = name == "QUIT";
        let reply = execute(&shared, &mut session, &name, &args[1..]);
        if write_reply(&mut output, &reply).is_err() || output.flush().is_err() {
            break;
        }
        if quit {
            break;
        }
    }
    let _ = output.get_mut().flush();
}

fn ok() -> RespValue {
    RespValue::SimpleString(Bytes::from_static(b"OK"))
}

fn err(message: &str) -> RespValue {
    RespValue::Error(message.to_string())
}

fn bulk(data: Vec<u8>) -> RespValue {
    RespValue::BulkString(Some(Bytes::from(data)))
}

fn int_arg(arg: &[u8]) -> Option<i64> {
    std::str::from_utf8(arg).ok()?.parse().ok()
}

fn execute(shared: &Shared, session: &mut Session, name: &str, args: &[Vec<u8>]) -> RespValue {
    if name == "AUTH" {
        return match (&shared.password, args.first()) {
            (Some(expected), Some(given)) if expected.as_bytes() == given.as_slice() => {
                session.authed = true;
                ok()
            }
            (None, _) => err("ERR Client sent AUTH, but no password is set"),
            _ => err("WRONGPASS invalid username-password pair"),
        };
    }
    if !session.authed {
        return err("NOAUTH Authentication required.");
    }

    let db = session.db;
    let key = |i: usize| (db, args.get(i).cloned().unwrap_or_default());
    let mut data = shared.data.lock().unwrap();

    match (name, args.len()) {
        ("PING", 0) => RespValue::SimpleString(Bytes::from_static(b"PONG")),
        ("ECHO", 1) => bulk(args[0].clone()),
        ("QUIT", 0) => ok(),
        ("SELECT", 1) => match int_arg(&args[0]) {
            Some(index) if (0..16).contains(&index) => {
                session.db = index;
                ok()
            }
            _ => err("ERR DB index is out of range"),
        },
        ("CLIENT", 2) if args[0].eq_ignore_ascii_case(b"SETNAME") => ok(),
        ("GET", 1) => match data.get(&key(0)) {
            Some(Value::Str(v)) => bulk(v.clone()),
            Some(Value::List(_)) => {
                err("WRONGTYPE Operation against a key holding the wrong kind of value")
            }
            None => RespValue::BulkString(None),
        },
        ("SET", 2) | ("SET", 4) => {
            data.insert(key(0), Value::Str(args[1].clone()));
            if args.len() == 4 {
                if let Some(secs) = int_arg(&args[3]) {
                    shared.ttl.lock().unwrap().insert(key(0), secs);
                }
            }
            ok()
        }
        ("DEL", n) if n > 0 => {
            let removed = (0..n).filter(|&i| data.remove(&key(i)).is_some()).count();
            RespValue::Integer(removed as i64)
        }
        ("EXISTS", 1) => RespValue::Integer(data.contains_key(&key(0)) as i64),
        ("INCR", 1) | ("INCRBY", 2) => {
            let delta = if name == "INCR" {
                Some(1)
            } else {
                int_arg(&args[1])
            };
            let current = match data.get(&key(0)) {
                Some(Value::Str(v)) => int_arg(v),
                Some(Value::List(_)) => None,
                None => Some(0),
            };
            match (current, delta) {
                (Some(current), Some(delta)) => {
                    let next = current + delta;
                    data.insert(key(0), Value::Str(next.to_string().into_bytes()));
                    RespValue::Integer(next)
                }
                _ => err("ERR value is not an integer or out of range"),
            }
        }
        ("EXPIRE", 2) => {
            if !data.contains_key(&key(0)) {
                return RespValue::Integer(0);
            }
            let secs = int_arg(&args[1]).unwrap_or(0);
            shared.ttl.lock().unwrap().insert(key(0), secs);
            RespValue::Integer(1)
        }
        ("TTL", 1) => {
            if !data.contains_key(&key(0)) {
                return RespValue::Integer(-2);
            }
            RespValue::Integer(*shared.ttl.lock().unwrap().get(&key(0)).unwrap_or(&-1))
        }
        ("MGET", n) if n > 0 => RespValue::Array(Some(
            (0..n)
                .map(|i| match data.get(&key(i)) {
                    Some(Value::Str(v)) => bulk(v.clone()),
                    _ => RespValue::BulkString(None),
                })
                .collect(),
        )),
        ("RPUSH", n) if n > 1 => {
            let entry = data
                .entry(key(0))
                .or_insert_with(|| Value::List(VecDeque::new()));
            match entry {
                Value::List(list) => {
                    list.extend(args[1..].iter().cloned());
                    RespValue::Integer(list.len() as i64)
                }
                Value::Str(_) => {
                    err("WRONGTYPE Operation against a key holding the wrong kind of value")
                }
            }
        }
        ("LRANGE", 3) => {
            let (Some(start), Some(stop)) = (int_arg(&args[1]), int_arg(&args[2])) else {
                return err("ERR value is not an integer or out of range");
            };
            match data.get(&key(0)) {
                Some(Value::List(list)) => {
                    let len = list.len() as i64;
                    let norm = |i: i64| if i < 0 { (len + i).max(0) } else { i };
                    let (start, stop) = (norm(start), norm(stop).min(len - 1));
                    RespValue::Array(Some(
                        (start..=stop)
                            .filter_map(|i| list.get(i as usize).cloned().map(bulk))
                            .collect(),
                    ))
                }
                _ => RespValue::Array(Some(Vec::new())),
            }
        }
        ("BLPOP", n) | ("BRPOP", n) if n > 1 => {
            for i in 0..n - 1 {
                if let Some(Value::List(list)) = data.get_mut(&key(i)) {
                    let popped = if name == "BLPOP" {
                        list.pop_front()
                    } else {
                        list.pop_back()
                    };
                    if let Some(value) = popped {
                        return RespValue::Array(Some(vec![bulk(args[i].clone()), bulk(value)]));
                    }
                }
            }
            drop(data);
            thread::sleep(shared.block_for);
            RespValue::Array(None)
        }
        _ => err(&format!("ERR unknown command or wrong arguments for '{}'", name)),
    }
}
