//! In-band control: interests under `ccnx:/local/forwarder/...` are routed
//! here by the dispatcher. The third name segment selects the module, the
//! fourth the command; free-form arguments ride in the payload. Every
//! command answers with a content object named by the request.

use std::sync::Arc;

use ccnx_codec::{ContentObject, Interest, Name};
use serde_json::json;

use crate::dispatch::Athena;
use crate::error::Result;
use crate::linkset::LinkVector;

pub const MODULE_CONTROL: &str = "Control";
pub const MODULE_FIB: &str = "FIB";
pub const MODULE_PIT: &str = "PIT";
pub const MODULE_CONTENT_STORE: &str = "ContentStore";
pub const MODULE_LINK: &str = "TransportLinkAdapter";

const COMMAND_ADD: &str = "add";
const COMMAND_LIST: &str = "list";
const COMMAND_LOOKUP: &str = "lookup";
const COMMAND_QUIT: &str = "quit";
const COMMAND_REMOVE: &str = "remove";
const COMMAND_RESIZE: &str = "resize";
const COMMAND_SET: &str = "set";
const COMMAND_SPAWN: &str = "spawn";
const COMMAND_STAT: &str = "stat";
const COMMAND_STATS: &str = "stats";

pub(crate) async fn dispatch(
    athena: &mut Athena,
    interest: &Arc<Interest>,
    ingress: &LinkVector,
) -> Option<ContentObject> {
    let name = interest.name.clone()?;
    let payload = String::from_utf8_lossy(&interest.payload).trim().to_string();
    let module = name.segment_str(2).unwrap_or_default().to_string();
    let command = name.segment_str(3).unwrap_or_default().to_string();

    let body = match module.as_str() {
        MODULE_CONTROL => control_command(athena, &name, &command, &payload),
        MODULE_FIB => fib_command(athena, &command, &payload, ingress),
        MODULE_PIT => pit_command(athena, &name, &command),
        MODULE_CONTENT_STORE => store_command(athena, &name, &command, &payload),
        MODULE_LINK => link_command(athena, &command, &payload).await,
        other => format!("unknown control module ({})", other),
    };

    Some(athena.control_response(name, body))
}

fn control_command(athena: &mut Athena, name: &Name, command: &str, payload: &str) -> String {
    match command {
        COMMAND_QUIT => {
            athena.state = crate::dispatch::RunState::Exit;
            "Athena exiting".to_string()
        }
        COMMAND_STATS => {
            let wall = athena.clock.wall_ms();
            let mut stats = serde_json::to_value(&athena.stats)
                .unwrap_or_else(|_| json!({}));
            if let Some(map) = stats.as_object_mut() {
                map.insert("moduleName".into(), json!("athena"));
                map.insert("time".into(), json!(wall));
                map.insert("uptimeMs".into(), json!(wall - athena.start_wall_ms));
            }
            stats.to_string()
        }
        COMMAND_SET => set_command(name),
        COMMAND_SPAWN => match spawn_instance(payload) {
            Ok(()) => format!("Athena spawned at {}", payload),
            Err(error) => format!("Could not spawn a new Athena instance: {}", error),
        },
        other => format!("unknown Control command ({})", other),
    }
}

fn set_command(name: &Name) -> String {
    let (Some(variable), Some(value)) = (name.segment_str(4), name.segment_str(5)) else {
        return "Athena set arguments required <name> <value>".to_string();
    };
    if variable != "level" {
        return format!("Athena unknown set name ({})", variable);
    }
    let filter = match value {
        "off" => log::LevelFilter::Off,
        "error" => log::LevelFilter::Error,
        "notice" => log::LevelFilter::Warn,
        "info" => log::LevelFilter::Info,
        "debug" => log::LevelFilter::Debug,
        "all" => log::LevelFilter::Trace,
        other => return format!("unknown logging level ({})", other),
    };
    log::set_max_level(filter);
    format!("set athena logging level to {}", value)
}

/// A spawned instance gets its own thread, runtime, and tables; nothing is
/// shared with the spawning forwarder.
fn spawn_instance(uri: &str) -> Result<()> {
    let uri = uri.to_string();
    std::thread::Builder::new().name("athena".into()).spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(error) => {
                log::warn!("athena: spawned instance runtime failed: {}", error);
                return;
            }
        };
        let local = tokio::task::LocalSet::new();
        local.block_on(&runtime, async move {
            let mut athena = Athena::new(0);
            match athena.transport.open(&uri).await {
                Ok(_) => athena.run().await,
                Err(error) => {
                    log::warn!("athena: spawned instance couldn't open <{}>: {}", uri, error);
                }
            }
        });
    })?;
    Ok(())
}

fn fib_command(athena: &mut Athena, command: &str, payload: &str, ingress: &LinkVector) -> String {
    match command {
        COMMAND_LIST => {
            let entries: Vec<serde_json::Value> = athena
                .fib
                .borrow()
                .list_entries()
                .into_iter()
                .map(|(prefix, id)| {
                    let link = athena
                        .transport
                        .link_id_to_name(id)
                        .unwrap_or_else(|| format!("link-{}", id));
                    json!({ "name": prefix.to_string(), "link": link })
                })
                .collect();
            json!({ "result": entries }).to_string()
        }
        COMMAND_LOOKUP => match Name::from_uri(payload) {
            Ok(lookup) => athena.fib.borrow().lookup(&lookup).to_string(),
            Err(_) => format!("FIB lookup requires a name ({})", payload),
        },
        COMMAND_ADD | COMMAND_REMOVE => {
            let mut arguments = payload.split_whitespace();
            let Some(prefix) = arguments.next() else {
                return "FIB commands require <prefix> [<linkName>]".to_string();
            };
            let Ok(prefix) = Name::from_uri(prefix) else {
                return format!("bad route prefix ({})", prefix);
            };

            let links = match arguments.next() {
                Some(link_name) => match athena.transport.link_name_to_id(link_name) {
                    Some(id) => LinkVector::single(id),
                    None => return format!("unknown link ({})", link_name),
                },
                None => ingress.clone(),
            };

            if command == COMMAND_ADD {
                athena.fib.borrow_mut().add_route(prefix.clone(), &links);
                format!("Route added: {} -> {}", prefix, links)
            } else if athena.fib.borrow_mut().delete_route(&prefix, &links) {
                format!("Route removed: {} -> {}", prefix, links)
            } else {
                format!("no route for {}", prefix)
            }
        }
        other => format!("unknown FIB command ({})", other),
    }
}

fn pit_command(athena: &mut Athena, name: &Name, command: &str) -> String {
    match command {
        COMMAND_LIST => {
            let entries = athena.pit.borrow().list_entries();
            if entries.is_empty() {
                "PIT empty".to_string()
            } else {
                entries.join("\n")
            }
        }
        COMMAND_STAT => match name.segment_str(4) {
            Some("size") => json!({ "size": athena.pit.borrow().len() }).to_string(),
            Some("avgEntryLifetime") => {
                json!({ "avgEntryLifetime": athena.pit.borrow().mean_entry_lifetime_ms() })
                    .to_string()
            }
            other => format!("unknown PIT statistic ({})", other.unwrap_or_default()),
        },
        other => format!("unknown PIT command ({})", other),
    }
}

fn store_command(athena: &mut Athena, name: &Name, command: &str, payload: &str) -> String {
    match command {
        COMMAND_RESIZE => match payload.parse::<usize>() {
            Ok(capacity_mb) => {
                athena.store.borrow_mut().set_capacity(capacity_mb);
                format!("Content store resized to {}MB, contents flushed", capacity_mb)
            }
            Err(_) => format!("ContentStore resize requires a size in MB ({})", payload),
        },
        COMMAND_STAT => match name.segment_str(4) {
            Some("size") => {
                let store = athena.store.borrow();
                json!({
                    "size": store.current_size_bytes(),
                    "capacity": store.capacity_bytes(),
                    "entries": store.len(),
                })
                .to_string()
            }
            Some("hits") => {
                let store = athena.store.borrow();
                json!({ "hits": store.hits(), "misses": store.misses() }).to_string()
            }
            other => format!("unknown ContentStore statistic ({})", other.unwrap_or_default()),
        },
        other => format!("unknown ContentStore command ({})", other),
    }
}

async fn link_command(athena: &mut Athena, command: &str, payload: &str) -> String {
    match command {
        COMMAND_ADD => match athena.transport.open(payload).await {
            Ok(link_name) => link_name,
            Err(error) => format!("link add failed: {}", error),
        },
        COMMAND_REMOVE => match athena.transport.close_by_name(payload) {
            Ok(()) => format!("Link removed: {}", payload),
            Err(error) => format!("link remove failed: {}", error),
        },
        COMMAND_LIST => serde_json::to_string(&athena.transport.list_links())
            .unwrap_or_else(|error| format!("link list failed: {}", error)),
        other => format!("unknown TransportLinkAdapter command ({})", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    use ccnx_codec::CcnxMessage;

    use crate::clock::ManualClock;
    use crate::dispatch::RunState;

    fn forwarder() -> Athena {
        Athena::with_clock(Rc::new(ManualClock::new()), 1)
    }

    /// Drives a control interest through the dispatcher and fetches the
    /// response from the content store, where the reverse-path delivery
    /// leaves a copy.
    async fn control(athena: &mut Athena, uri: &str, payload: &str) -> String {
        let request = Arc::new(
            Interest::new(Name::from_uri(uri).expect("uri")).with_payload(payload.as_bytes()),
        );
        athena
            .process_message(CcnxMessage::Interest(request.clone()), &LinkVector::single(0))
            .await;
        let response = athena
            .content_store()
            .borrow_mut()
            .get_match(&request)
            .expect("control response cached");
        String::from_utf8_lossy(&response.payload).to_string()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn stats_reports_counters_as_json() {
        let mut athena = forwarder();
        let body = control(&mut athena, "ccnx:/local/forwarder/Control/stats", "").await;
        let value: serde_json::Value = serde_json::from_str(&body).expect("json");
        assert_eq!(value["moduleName"], "athena");
        assert_eq!(value["numProcessedInterests"], 1);
        assert_eq!(value["numProcessedControlMessages"], 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn quit_acknowledges_and_exits() {
        let mut athena = forwarder();
        let body = control(&mut athena, "ccnx:/local/forwarder/Control/quit", "").await;
        assert_eq!(body, "Athena exiting");
        assert_eq!(athena.state(), RunState::Exit);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn set_level_round_trips() {
        let mut athena = forwarder();
        let body =
            control(&mut athena, "ccnx:/local/forwarder/Control/set/level/debug", "").await;
        assert_eq!(body, "set athena logging level to debug");

        let body =
            control(&mut athena, "ccnx:/local/forwarder/Control/set/level/loud", "").await;
        assert_eq!(body, "unknown logging level (loud)");

        let body = control(&mut athena, "ccnx:/local/forwarder/Control/set", "").await;
        assert_eq!(body, "Athena set arguments required <name> <value>");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fib_add_defaults_to_ingress_link() {
        let mut athena = forwarder();
        let body = control(&mut athena, "ccnx:/local/forwarder/FIB/add", "lci:/foo").await;
        assert_eq!(body, "Route added: ccnx:/foo -> {0}");

        let lookup = control(&mut athena, "ccnx:/local/forwarder/FIB/lookup", "lci:/foo/bar").await;
        assert_eq!(lookup, "{0}");

        let body = control(&mut athena, "ccnx:/local/forwarder/FIB/remove", "lci:/foo").await;
        assert_eq!(body, "Route removed: ccnx:/foo -> {0}");
        let lookup = control(&mut athena, "ccnx:/local/forwarder/FIB/lookup", "lci:/foo").await;
        assert_eq!(lookup, "{}");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fib_add_with_unknown_link_name_fails() {
        let mut athena = forwarder();
        let body =
            control(&mut athena, "ccnx:/local/forwarder/FIB/add", "lci:/foo missing-link").await;
        assert_eq!(body, "unknown link (missing-link)");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn pit_and_store_stats_are_json() {
        let mut athena = forwarder();
        let body = control(&mut athena, "ccnx:/local/forwarder/PIT/stat/size", "").await;
        let value: serde_json::Value = serde_json::from_str(&body).expect("json");
        // The control interest itself is pending while being served.
        assert_eq!(value["size"], 1);

        let body = control(&mut athena, "ccnx:/local/forwarder/ContentStore/stat/hits", "").await;
        let value: serde_json::Value = serde_json::from_str(&body).expect("json");
        assert!(value["hits"].is_u64() && value["misses"].is_u64());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn store_resize_flushes_contents() {
        let mut athena = forwarder();
        athena.content_store().borrow_mut().put(Arc::new(
            ContentObject::new(Name::from_uri("ccnx:/keep").expect("uri")).with_payload(b"x"),
        ));
        let body = control(&mut athena, "ccnx:/local/forwarder/ContentStore/resize", "4").await;
        assert_eq!(body, "Content store resized to 4MB, contents flushed");
        assert!(athena
            .content_store()
            .borrow_mut()
            .get_match(&Interest::new(Name::from_uri("ccnx:/keep").expect("uri")))
            .is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn link_list_is_a_json_array() {
        let mut athena = forwarder();
        let body =
            control(&mut athena, "ccnx:/local/forwarder/TransportLinkAdapter/list", "").await;
        let value: serde_json::Value = serde_json::from_str(&body).expect("json");
        assert!(value.is_array());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unknown_module_and_command_answer_with_errors() {
        let mut athena = forwarder();
        let body = control(&mut athena, "ccnx:/local/forwarder/Oracle/ask", "").await;
        assert_eq!(body, "unknown control module (Oracle)");
        let body = control(&mut athena, "ccnx:/local/forwarder/FIB/defragment", "").await;
        assert_eq!(body, "unknown FIB command (defragment)");
    }
}
