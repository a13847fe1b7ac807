//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation of every section the lifecycle consumes
//! - Runs before any side effect (lock, pid, bind) happens
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Each error names the offending section
//! - Optional sections (`lockfile`, `setuid`) may be absent; required ones
//!   (`pidfile`, `logs.system`, `logs.http`, `http`) may not

use std::fmt;

use crate::config::tree::{ConfigTree, LookupError};
use crate::environment::Environment;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub section: String,
    pub message: String,
}

impl ValidationError {
    fn new(section: &str, message: impl Into<String>) -> Self {
        Self {
            section: section.to_string(),
            message: message.into(),
        }
    }

    fn lookup(section: &str, err: LookupError) -> Self {
        Self::new(section, err.to_string())
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.section, self.message)
    }
}

/// Validate the `env` section of the document.
pub fn validate_config(tree: &ConfigTree, env: Environment) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let env = env.as_str();

    if let Err(e) = tree.section(&[env]) {
        errors.push(ValidationError::lookup(env, e));
        return Err(errors);
    }

    match tree.optional_section(&[env, "lockfile"]) {
        Ok(section) => collect(&mut errors, check_lockfile(section.as_ref())),
        Err(e) => errors.push(ValidationError::lookup("lockfile", e)),
    }

    match tree.section(&[env, "pidfile"]) {
        Ok(section) => collect(&mut errors, check_pidfile(&section)),
        Err(e) => errors.push(ValidationError::lookup("pidfile", e)),
    }

    match tree.optional_section(&[env, "setuid"]) {
        Ok(section) => collect(&mut errors, check_setuid(section.as_ref())),
        Err(e) => errors.push(ValidationError::lookup("setuid", e)),
    }

    for tag in ["system", "http"] {
        let name = format!("logs.{tag}");
        match tree.section(&[env, "logs", tag]) {
            Ok(section) => collect(&mut errors, check_log(&name, &section)),
            Err(e) => errors.push(ValidationError::lookup(&name, e)),
        }
    }

    match tree.section(&[env, "http"]) {
        Ok(section) => collect(&mut errors, check_http(&section)),
        Err(e) => errors.push(ValidationError::lookup("http", e)),
    }

    if let Err(e @ LookupError::TypeMismatch { .. }) = tree.get_str(&[env, "workdir"]) {
        errors.push(ValidationError::lookup("workdir", e));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn collect(errors: &mut Vec<ValidationError>, result: Result<(), ValidationError>) {
    if let Err(e) = result {
        errors.push(e);
    }
}

/// `lockfile` section: optional; `file` required when enabled.
pub fn check_lockfile(section: Option<&ConfigTree>) -> Result<(), ValidationError> {
    const NAME: &str = "lockfile";
    let Some(section) = section else {
        return Ok(());
    };
    let enabled = section.get_bool(&["lockfile"]).map_err(|_| {
        ValidationError::new(NAME, "boolean `lockfile` (true or false) must be present")
    })?;
    if enabled {
        let file = section.get_str(&["file"]).map_err(|_| {
            ValidationError::new(NAME, "string `file` with a path writable by the program must be present")
        })?;
        if file.is_empty() {
            return Err(ValidationError::new(NAME, "path to lock file cannot be empty"));
        }
    }
    Ok(())
}

/// `pidfile` section: `file` required when enabled.
pub fn check_pidfile(section: &ConfigTree) -> Result<(), ValidationError> {
    const NAME: &str = "pidfile";
    let enabled = section
        .get_bool(&["pidfile"])
        .map_err(|e| ValidationError::lookup(NAME, e))?;
    if !enabled {
        return Ok(());
    }
    let file = section
        .get_str(&["file"])
        .map_err(|e| ValidationError::lookup(NAME, e))?;
    if file.is_empty() {
        return Err(ValidationError::new(NAME, "`file` must not be empty"));
    }
    Ok(())
}

/// `setuid` section: optional; `user` required when enabled.
pub fn check_setuid(section: Option<&ConfigTree>) -> Result<(), ValidationError> {
    const NAME: &str = "setuid";
    let Some(section) = section else {
        return Ok(());
    };
    let enabled = section
        .get_bool(&["setuid"])
        .map_err(|e| ValidationError::lookup(NAME, e))?;
    if !enabled {
        return Ok(());
    }
    let user = section
        .get_str(&["user"])
        .map_err(|e| ValidationError::lookup(NAME, e))?;
    section
        .get_str(&["group"])
        .map_err(|e| ValidationError::lookup(NAME, e))?;
    if user.is_empty() {
        return Err(ValidationError::new(
            NAME,
            "`user` must name an existing user when setuid = true",
        ));
    }
    Ok(())
}

/// `logs.<tag>` section.
pub fn check_log(name: &str, section: &ConfigTree) -> Result<(), ValidationError> {
    let output = section
        .get_str(&["output"])
        .map_err(|_| ValidationError::new(name, "no `output` in log config"))?;

    match section.get_str(&["format"]) {
        Ok("" | "plain" | "json" | "console") => {}
        Ok(other) => {
            return Err(ValidationError::new(name, format!("wrong log format {other:?}")));
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(ValidationError::lookup(name, e)),
    }

    match output {
        "stdout" | "stderr" | "null" => Ok(()),
        "file" => {
            let path = section
                .get_str(&["path"])
                .map_err(|e| ValidationError::lookup(name, e))?;
            if path.is_empty() {
                return Err(ValidationError::new(name, "`path` must not be empty for file output"));
            }
            let rotate = section
                .get_bool(&["rotate", "rotate"])
                .map_err(|e| ValidationError::lookup(name, e))?;
            if rotate {
                section
                    .get_bool(&["rotate", "sighup"])
                    .map_err(|e| ValidationError::lookup(name, e))?;
            }
            Ok(())
        }
        "syslog" => Err(ValidationError::new(name, "syslog output is not supported")),
        other => Err(ValidationError::new(name, format!("unknown log output {other:?}"))),
    }
}

/// `http` section.
pub fn check_http(section: &ConfigTree) -> Result<(), ValidationError> {
    const NAME: &str = "http";
    let lookup = |e: LookupError| ValidationError::lookup(NAME, e);

    let timeout = section
        .get_int(&["shutdown_timeout"])
        .map_err(|_| ValidationError::new(NAME, "integer `shutdown_timeout` must be present"))?;
    if timeout < 0 {
        return Err(ValidationError::new(NAME, "`shutdown_timeout` must be zero or above"));
    }

    section.section(&["ssl"]).map_err(lookup)?;
    let ssl = section.get_bool(&["ssl", "ssl"]).map_err(lookup)?;
    if ssl {
        for field in ["cert", "key"] {
            let value = section.get_str(&["ssl", field]).map_err(lookup)?;
            if value.is_empty() {
                return Err(ValidationError::new(NAME, format!("ssl `{field}` is empty")));
            }
        }
    }

    section.section(&["http2"]).map_err(lookup)?;
    if section.get_bool(&["http2", "http2"]).map_err(lookup)? {
        return Err(ValidationError::new(NAME, "HTTP/2 must be disabled, it is not supported"));
    }

    let socket_type = section.get_str(&["socket_type"]).map_err(lookup)?;
    match socket_type {
        "tcp" => {}
        "unix" if ssl => {
            return Err(ValidationError::new(NAME, "ssl is only supported on tcp sockets"));
        }
        "unix" => {}
        _ => return Err(ValidationError::new(NAME, "`socket_type` must be tcp or unix")),
    }

    section
        .get_str(&["address"])
        .map_err(|_| ValidationError::new(NAME, "no `address` (host:port or path)"))?;
    section
        .get_str(&["domain"])
        .map_err(|_| ValidationError::new(NAME, "no `domain` name"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = r#"
        [test]
        workdir = ""
        [test.lockfile]
        lockfile = true
        file = "./run/app.lock"
        [test.pidfile]
        pidfile = true
        file = "./run/app.pid"
        [test.setuid]
        setuid = false
        [test.logs.system]
        output = "stderr"
        format = "plain"
        [test.logs.http]
        output = "file"
        path = "./logs/http.log"
        rotate = { rotate = true, sighup = true }
        [test.http]
        shutdown_timeout = 5000
        ssl = { ssl = false }
        http2 = { http2 = false }
        socket_type = "tcp"
        address = "localhost:0"
        domain = "localhost"
    "#;

    fn tree(text: &str) -> ConfigTree {
        ConfigTree::parse(text).unwrap()
    }

    #[test]
    fn accepts_complete_config() {
        assert_eq!(validate_config(&tree(GOOD), Environment::Test), Ok(()));
    }

    #[test]
    fn missing_environment_section() {
        let errors = validate_config(&tree(GOOD), Environment::Prod).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].section, "prod");
    }

    #[test]
    fn aggregates_errors_across_sections() {
        let broken = GOOD
            .replace("socket_type = \"tcp\"", "socket_type = \"udp\"")
            .replace("file = \"./run/app.pid\"", "file = \"\"");
        let errors = validate_config(&tree(&broken), Environment::Test).unwrap_err();
        let sections: Vec<&str> = errors.iter().map(|e| e.section.as_str()).collect();
        assert_eq!(sections, vec!["pidfile", "http"]);
    }

    #[test]
    fn http2_must_be_disabled() {
        let section = tree(
            r#"
            shutdown_timeout = 0
            ssl = { ssl = false }
            http2 = { http2 = true }
            socket_type = "tcp"
            address = ":80"
            domain = "x"
            "#,
        );
        assert!(check_http(&section).is_err());
    }

    #[test]
    fn ssl_requires_cert_and_key_and_tcp() {
        let base = r#"
            shutdown_timeout = 10
            http2 = { http2 = false }
            address = "/tmp/s.sock"
            domain = "x"
        "#;
        let no_key = tree(&format!("{base}\nsocket_type = \"tcp\"\nssl = {{ ssl = true, cert = \"c.pem\" }}"));
        assert!(check_http(&no_key).is_err());

        let unix = tree(&format!(
            "{base}\nsocket_type = \"unix\"\nssl = {{ ssl = true, cert = \"c.pem\", key = \"k.pem\" }}"
        ));
        assert!(check_http(&unix).is_err());
    }

    #[test]
    fn negative_shutdown_timeout() {
        let section = tree(
            r#"
            shutdown_timeout = -1
            ssl = { ssl = false }
            http2 = { http2 = false }
            socket_type = "tcp"
            address = ":80"
            domain = "x"
            "#,
        );
        assert!(check_http(&section).is_err());
    }

    #[test]
    fn lockfile_rules() {
        assert!(check_lockfile(None).is_ok());
        assert!(check_lockfile(Some(&tree("lockfile = false"))).is_ok());
        assert!(check_lockfile(Some(&tree("lockfile = true"))).is_err());
        assert!(check_lockfile(Some(&tree("lockfile = true\nfile = \"\""))).is_err());
        assert!(check_lockfile(Some(&tree("lockfile = \"yes\""))).is_err());
    }

    #[test]
    fn setuid_rules() {
        assert!(check_setuid(None).is_ok());
        assert!(check_setuid(Some(&tree("setuid = false"))).is_ok());
        assert!(check_setuid(Some(&tree("setuid = true\nuser = \"\"\ngroup = \"\""))).is_err());
        assert!(check_setuid(Some(&tree("setuid = true\nuser = \"nobody\""))).is_err());
        assert!(check_setuid(Some(&tree("setuid = true\nuser = \"nobody\"\ngroup = \"\""))).is_ok());
    }

    #[test]
    fn log_rules() {
        assert!(check_log("logs.system", &tree("output = \"null\"")).is_ok());
        assert!(check_log("logs.system", &tree("format = \"plain\"")).is_err());
        assert!(check_log("logs.system", &tree("output = \"syslog\"")).is_err());
        assert!(check_log("logs.system", &tree("output = \"stderr\"\nformat = \"xml\"")).is_err());
        assert!(check_log("logs.system", &tree("output = \"file\"\npath = \"a.log\"")).is_err());
        assert!(check_log(
            "logs.system",
            &tree("output = \"file\"\npath = \"a.log\"\nrotate = { rotate = false }")
        )
        .is_ok());
    }
}
