//! Scripted host channel for runtime tests

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::error::Result;
use crate::protocol::{HostChannel, RefResponse, StreamProgress, Verb};
use crate::types::{RefId, Reference};

/// Answers requests from canned state and records every request
#[derive(Default)]
pub(crate) struct ScriptedChannel {
    requests: Mutex<Vec<(Verb, Value)>>,
    available: Mutex<HashMap<RefId, RefResponse>>,
    packages: Mutex<HashMap<String, Value>>,
    progress: Mutex<VecDeque<StreamProgress>>,
    next_index: Mutex<u64>,
    output_dir: Option<PathBuf>,
}

impl ScriptedChannel {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_output_dir(dir: &Path) -> Self {
        Self {
            output_dir: Some(dir.to_path_buf()),
            ..Self::default()
        }
    }

    pub(crate) fn make_available(&self, id: &str, response: RefResponse) {
        self.available.lock().insert(id.to_string(), response);
    }

    pub(crate) fn set_package(&self, key: &str, value: Value) {
        self.packages.lock().insert(key.to_string(), value);
    }

    pub(crate) fn push_stream_progress(&self, progress: StreamProgress) {
        self.progress.lock().push_back(progress);
    }

    pub(crate) fn request_count(&self, verb: Verb) -> usize {
        self.requests.lock().iter().filter(|(v, _)| *v == verb).count()
    }

    pub(crate) fn total_requests(&self) -> usize {
        self.requests.lock().len()
    }

    pub(crate) fn last_request(&self, verb: Verb) -> Option<Value> {
        self.requests
            .lock()
            .iter()
            .rev()
            .find(|(v, _)| *v == verb)
            .map(|(_, args)| args.clone())
    }

    fn output_id(index: &Value) -> String {
        format!("out{}", index)
    }
}

impl HostChannel for ScriptedChannel {
    fn synchronous_request(&self, verb: Verb, args: Value) -> Result<Value> {
        self.requests.lock().push((verb, args.clone()));

        let response = match verb {
            Verb::OpenRef | Verb::OpenRefAsync => {
                let id = args["ref"]["id"].as_str().unwrap_or_default();
                self.available
                    .lock()
                    .get(id)
                    .map(RefResponse::to_value)
                    .unwrap_or_else(|| RefResponse::Unavailable.to_value())
            }
            Verb::PublishString => {
                let bytes = BASE64
                    .decode(args["strdata"].as_str().unwrap_or_default())
                    .unwrap_or_default();
                json!({ "ref": Reference::inline(Self::output_id(&args["index"]), &bytes) })
            }
            Verb::AllocateOutput => {
                let mut next = self.next_index.lock();
                *next += 1;
                json!({ "index": *next })
            }
            Verb::OpenOutput => {
                let dir = self.output_dir.clone().unwrap_or_else(std::env::temp_dir);
                json!({ "filename": dir.join(Self::output_id(&args["index"])) })
            }
            Verb::CloseOutput => json!({
                "ref": Reference::concrete(Self::output_id(&args["index"]), args["size"].as_u64())
            }),
            Verb::Spawn => {
                let n = self.request_count(Verb::Spawn);
                json!({ "outputs": [Reference::future(format!("child{}:retval", n))] })
            }
            Verb::PackageLookup => {
                let key = args["key"].as_str().unwrap_or_default();
                json!({ "value": self.packages.lock().get(key).cloned() })
            }
            Verb::CloseRef => json!({}),
            Verb::WaitStream => match self.progress.lock().pop_front() {
                Some(progress) => serde_json::to_value(progress)?,
                None => json!({ "size": args["size"], "done": false }),
            },
        };
        Ok(response)
    }
}
