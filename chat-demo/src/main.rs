use couchbase_lite::{
    fallible_streaming_iterator::FallibleStreamingIterator, Authenticator, Database,
    DatabaseFlags, Endpoint, ListenerToken, MutableDocument, Replicator,
    ReplicatorConfiguration,
};
use log::{error, info, trace};
use serde::{Deserialize, Serialize};
use std::{env, path::Path, sync::mpsc};
use tokio::io::AsyncBufReadExt;

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
struct Message {
    msg: String,
}

struct Chat {
    db: Database,
    repl: Option<Replicator>,
    _listeners: Vec<ListenerToken>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let runtime = tokio::runtime::Runtime::new()?;
    #[cfg(feature = "use-tokio-websocket")]
    Database::init_socket_impl(runtime.handle().clone());

    let db_path = env::args().nth(1).expect("No path to db file");
    let db_path = Path::new(&db_path);
    let sync_url = env::args().nth(2);
    let token: Option<String> = env::args().nth(3);
    let (db_thread, db_exec) = run_db_thread(db_path, sync_url, token);

    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let db_exec_repl = db_exec.clone();
    runtime.block_on(async move {
        static EDIT_PREFIX: &str = "edit ";
        let mut buf = String::new();
        let mut edit_id = None;
        loop {
            buf.clear();
            match stdin.read_line(&mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    error!("reading from stdin fail: {}", err);
                    break;
                }
            }
            let msg = buf.trim_end();
            if msg.is_empty() {
                continue;
            }
            if msg == "quit" {
                println!("Time to quit");
                break;
            } else if let Some(id) = msg.strip_prefix(EDIT_PREFIX) {
                edit_id = Some(id.to_string());
                println!("ready to edit message {:?}", edit_id);
            } else if msg == "status" {
                db_exec_repl.spawn(|chat| match chat.as_ref().and_then(|x| x.repl.as_ref()) {
                    Some(repl) => println!("replicator: {:?}", repl.status()),
                    None => println!("no replication"),
                });
            } else {
                println!("Your message is '{}'", msg);
                let msg = msg.to_string();
                let edit_id = edit_id.take();
                db_exec_repl.spawn(move |chat| {
                    if let Some(chat) = chat.as_mut() {
                        if let Err(err) = save_msg(&mut chat.db, &msg, edit_id.as_deref()) {
                            error!("save to db failed: {}", err);
                        }
                    } else {
                        eprintln!("db is NOT open");
                    }
                });
            }
        }
    });

    db_exec.spawn(|chat| {
        if let Some(chat) = chat.take() {
            if let Some(repl) = chat.repl.as_ref() {
                repl.stop();
            }
            drop(chat);
        } else {
            eprintln!("db is NOT open");
        }
    });
    drop(db_exec);
    if db_thread.join().is_err() {
        error!("db thread panicked");
    }
    println!("exiting");
    Ok(())
}

type Job<T> = Box<dyn FnOnce(&mut Option<T>) + Send>;

#[derive(Clone)]
struct DbQueryExecutor {
    inner: mpsc::Sender<Job<Chat>>,
}

impl DbQueryExecutor {
    pub fn spawn<F: FnOnce(&mut Option<Chat>) + Send + 'static>(&self, job: F) {
        if self.inner.send(Box::new(job)).is_err() {
            error!("db thread is gone, job dropped");
        }
    }
}

fn run_db_thread(
    db_path: &Path,
    sync_url: Option<String>,
    token: Option<String>,
) -> (std::thread::JoinHandle<()>, DbQueryExecutor) {
    let (sender, receiver) = std::sync::mpsc::channel::<Job<Chat>>();
    let db_path: std::path::PathBuf = db_path.into();
    let join_handle = std::thread::spawn(move || {
        let mut chat = match open_chat(&db_path, sync_url.as_deref(), token.as_deref()) {
            Ok(chat) => Some(chat),
            Err(err) => {
                error!("Initialiazion cause error: {}", err);
                None
            }
        };
        loop {
            match receiver.recv() {
                Ok(x) => x(&mut chat),
                Err(err) => {
                    trace!("db_thread: recv error: {}", err);
                    break;
                }
            }
        }
    });
    (join_handle, DbQueryExecutor { inner: sender })
}

fn open_chat(
    db_path: &Path,
    sync_url: Option<&str>,
    token: Option<&str>,
) -> Result<Chat, Box<dyn std::error::Error>> {
    let db = Database::open_with_flags(db_path, DatabaseFlags::CREATE)?;
    println!("We read all messages after open:");
    print_all_messages(&db)?;
    println!("read all messages after open done");

    let mut listeners = vec![db.add_change_listener(|change| {
        for id in change.doc_ids() {
            println!("changed message {}", id);
        }
    })?];

    let repl = match sync_url {
        Some(url) => {
            let mut config = ReplicatorConfiguration::new(&db, Endpoint::with_url(url)?)
                .with_continuous(true);
            if let Some(token) = token {
                config = config.with_authenticator(Authenticator::session(token, None));
            }
            let repl = Replicator::new(config)?;
            listeners.push(repl.add_change_listener(|status| {
                info!("replicator status: {:?}", status);
            }));
            listeners.push(repl.add_document_replication_listener(|direction, docs| {
                for doc in docs {
                    println!("{:?}: {} {:?}", direction, doc.id, doc.error);
                }
            }));
            repl.start(false)?;
            Some(repl)
        }
        None => None,
    };
    Ok(Chat {
        db,
        repl,
        _listeners: listeners,
    })
}

fn save_msg(
    db: &mut Database,
    data: &str,
    doc_id: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let msg = Message { msg: data.into() };
    let mut doc = {
        let enc = db.shared_encoder_session()?;
        if let Some(doc_id) = doc_id {
            println!("save_msg: edit message");
            MutableDocument::new_with_body(doc_id, &msg, enc)?
        } else {
            let mut doc = MutableDocument::new();
            doc.update_body(&msg, enc)?;
            doc
        }
    };
    println!("save_msg: doc id {}", doc.id());
    let mut trans = db.transaction()?;
    trans.save(&mut doc)?;
    trans.commit()?;
    Ok(())
}

fn print_all_messages(db: &Database) -> Result<(), Box<dyn std::error::Error>> {
    let query = db.n1ql_query("SELECT META().id FROM _ WHERE type = 'Message'")?;
    let mut iter = query.run()?;
    while let Some(item) = iter.next()? {
        let id = item.get_raw_checked(0)?;
        let id = id.as_str()?;
        println!("iteration id {}", id);
        let doc = db.get_existing(id)?;

        let db_msg: Message = doc.decode_body()?;
        println!("db_msg: {:?}", db_msg);
    }
    Ok(())
}
