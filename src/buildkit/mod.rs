//! Driver for the BuildKit builder CLI (`buildctl`).
//!
//! The daemon itself runs in an ephemeral per-job container (see
//! [`session`]); this module only assembles the CLI invocation that talks
//! to it, and the redaction applied before a command line is logged.

pub mod session;

use std::collections::BTreeMap;
use std::path::PathBuf;

/// A build secret handed to the CLI: the id is the original env key, the
/// src is the 0600 file the worker materialized the value into.
#[derive(Debug, Clone)]
pub struct BuildSecret {
    pub id: String,
    pub src: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BuildOpts {
    pub context_path: PathBuf,
    pub dockerfile_path: PathBuf,
    pub image_tag: String,
    pub build_args: BTreeMap<String, String>,
    pub secrets: Vec<BuildSecret>,
}

/// Handle on one BuildKit daemon address.
pub struct BuildKit {
    addr: String,
}

impl BuildKit {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
        }
    }

    /// The full `buildctl` argument vector for one build-and-push.
    /// Build-args are emitted in sorted key order, secrets sorted by id
    /// then src, so identical inputs produce identical invocations.
    pub fn build_args(&self, opts: &BuildOpts) -> Vec<String> {
        let mut args = vec![
            "--addr".to_string(),
            self.addr.clone(),
            "build".to_string(),
            "--frontend".to_string(),
            "dockerfile.v0".to_string(),
            "--local".to_string(),
            format!("context={}", opts.context_path.display()),
            "--local".to_string(),
            format!("dockerfile={}", opts.dockerfile_path.display()),
        ];

        for (key, value) in &opts.build_args {
            args.push("--opt".to_string());
            args.push(format!("build-arg:{}={}", key, value));
        }

        let mut secrets = opts.secrets.clone();
        secrets.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.src.cmp(&b.src)));
        for secret in &secrets {
            args.push("--secret".to_string());
            args.push(format!("id={},src={}", secret.id, secret.src.display()));
        }

        args.push("--output".to_string());
        args.push(format!(
            "type=image,name={},push=true,registry.insecure=true",
            opts.image_tag
        ));
        args.push("--progress".to_string());
        args.push("plain".to_string());

        args
    }
}

/// Render a command line for logging with build-arg values redacted.
pub fn sanitize_command_for_log(program: &str, args: &[String]) -> String {
    let mut rendered = vec![program.to_string()];
    rendered.extend(args.iter().map(|arg| redact_build_arg(arg)));
    rendered.join(" ")
}

fn redact_build_arg(arg: &str) -> String {
    let Some(idx) = arg.find("build-arg:") else {
        return arg.to_string();
    };
    let start = idx + "build-arg:".len();
    let Some(eq) = arg[start..].find('=') else {
        return arg.to_string();
    };
    format!("{}<redacted>", &arg[..start + eq + 1])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_opts() -> BuildOpts {
        BuildOpts {
            context_path: PathBuf::from("/tmp/ws"),
            dockerfile_path: PathBuf::from("/tmp/ws"),
            image_tag: "localhost:5000/user/proj:abc-b1-v20250101T000000Z".to_string(),
            build_args: BTreeMap::from([
                ("ZED".to_string(), "z".to_string()),
                ("ALPHA".to_string(), "a".to_string()),
            ]),
            secrets: vec![
                BuildSecret {
                    id: "TOKEN_B".to_string(),
                    src: PathBuf::from("/secrets/001_TOKEN_B"),
                },
                BuildSecret {
                    id: "TOKEN_A".to_string(),
                    src: PathBuf::from("/secrets/000_TOKEN_A"),
                },
            ],
        }
    }

    #[test]
    fn test_build_args_vector_shape() {
        let bk = BuildKit::new("tcp://172.17.0.2:1234");
        let args = bk.build_args(&sample_opts());
        let joined = args.join(" ");

        assert!(joined.starts_with("--addr tcp://172.17.0.2:1234 build"));
        assert!(joined.contains("--frontend dockerfile.v0"));
        assert!(joined.contains("--local context=/tmp/ws"));
        assert!(joined.contains("--local dockerfile=/tmp/ws"));
        assert!(joined.contains(
            "--output type=image,name=localhost:5000/user/proj:abc-b1-v20250101T000000Z,push=true,registry.insecure=true"
        ));
        assert!(joined.ends_with("--progress plain"));
    }

    #[test]
    fn test_build_args_sorted_by_key() {
        let bk = BuildKit::new("tcp://x:1234");
        let args = bk.build_args(&sample_opts());
        let joined = args.join(" ");

        let alpha = joined.find("build-arg:ALPHA=a").unwrap();
        let zed = joined.find("build-arg:ZED=z").unwrap();
        assert!(alpha < zed);
    }

    #[test]
    fn test_secrets_sorted_by_id() {
        let bk = BuildKit::new("tcp://x:1234");
        let args = bk.build_args(&sample_opts());
        let joined = args.join(" ");

        let a = joined.find("id=TOKEN_A,src=/secrets/000_TOKEN_A").unwrap();
        let b = joined.find("id=TOKEN_B,src=/secrets/001_TOKEN_B").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_redaction_hides_build_arg_values() {
        let line = sanitize_command_for_log(
            "buildctl",
            &[
                "--opt".to_string(),
                "build-arg:API_URL=https://internal.example.com".to_string(),
            ],
        );
        assert_eq!(line, "buildctl --opt build-arg:API_URL=<redacted>");
        assert!(!line.contains("internal.example.com"));
    }

    #[test]
    fn test_redaction_leaves_other_args_alone() {
        let line = sanitize_command_for_log(
            "buildctl",
            &["--progress".to_string(), "plain".to_string()],
        );
        assert_eq!(line, "buildctl --progress plain");
    }

    #[test]
    fn test_redaction_handles_missing_equals() {
        let line = sanitize_command_for_log("buildctl", &["build-arg:NOEQ".to_string()]);
        assert_eq!(line, "buildctl build-arg:NOEQ");
    }

    #[test]
    fn test_full_invocation_is_redacted() {
        let bk = BuildKit::new("tcp://x:1234");
        let args = bk.build_args(&sample_opts());
        let line = sanitize_command_for_log("buildctl", &args);
        assert!(line.contains("build-arg:ALPHA=<redacted>"));
        assert!(line.contains("build-arg:ZED=<redacted>"));
        assert!(!line.contains("build-arg:ALPHA=a "));
    }
}
