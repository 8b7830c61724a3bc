use std::net::AddrParseError;

/// Everything that can go wrong before a single socket is opened.
///
/// Construction-time failures in every ambient collaborator (CLI parsing,
/// URI resolution, object-generator validation) funnel into this type so
/// `main` has one place to map an error to the exit codes in the spec's
/// external-interfaces section.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid range \"{0}\": expected \"min:max\" with min < max")]
    BadRange(String),

    #[error("invalid ratio \"{0}\": expected \"a:b\" with non-negative integers")]
    BadRatio(String),

    #[error("invalid weighted size list \"{0}\": expected \"size1:weight1,size2:weight2,...\"")]
    BadWeightList(String),

    #[error("key range is empty: min ({min}) must be less than max ({max})")]
    EmptyKeyRange { min: u64, max: u64 },

    #[error("gaussian median {median} lies outside key range [{min}, {max}]")]
    MedianOutOfRange { median: f64, min: u64, max: u64 },

    #[error("could not parse server URI \"{0}\": {1}")]
    BadUri(String, String),

    #[error("could not parse socket address: {0}")]
    BadAddr(#[from] AddrParseError),

    #[error("cluster mode does not support {0}")]
    ClusterUnsupported(&'static str),

    #[error("arbitrary command \"{0}\" uses more than one key placeholder, which cluster mode forbids")]
    ClusterMultiKeyCommand(String),

    #[error("could not read import file \"{0}\": {1}")]
    ImportFile(String, String),

    #[error("arbitrary command placeholder \"{0}\" must be the entire argument, not a substring of \"{1}\"")]
    PlaceholderSubstring(&'static str, String),

    #[error("{0}")]
    Other(String),
}

/// Runtime failures inside the traffic-generation engine. None of these
/// unwind through an event loop — they are always handled at the call site
/// and either disable one connection or (rarely) escalate to a thread
/// restart request.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("connection #{conn_id}: {source}")]
    Connection {
        conn_id: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("connection #{conn_id}: connect timed out after {secs}s")]
    ConnectTimeout { conn_id: usize, secs: u64 },

    #[error(
        "connection #{conn_id}: parse error in state {state} after {consumed} bytes consumed \
         (buffer preview: {preview})"
    )]
    Parse {
        conn_id: usize,
        state: &'static str,
        consumed: usize,
        preview: String,
    },

    #[error("connection #{conn_id}: setup command {step} failed: {detail}")]
    SetupFailed {
        conn_id: usize,
        step: &'static str,
        detail: String,
    },

    #[error("TLS error on connection #{0}: {1}")]
    Tls(usize, String),

    #[error("output frontend error: {0}")]
    Output(String),
}
