//! Dockerfile (build recipe) generation.
//!
//! The generated recipe declares build-args up front, mounts build-secrets
//! into the prebuild/build RUN steps through a `set -e` shell wrapper, and
//! emits the run command verbatim as the container entrypoint. Secret
//! values never appear in the recipe text; only their ids do.

use std::collections::BTreeSet;

use crate::errors::DetectError;

use super::Runtime;

/// Directory BuildKit mounts secrets under inside a RUN step.
const SECRETS_DIR: &str = "/run/secrets";

/// Generate the recipe for one detected runtime.
///
/// `build_arg_keys` become `ARG` declarations (sorted, de-duplicated);
/// `secret_keys` are mounted into every prebuild/build RUN line.
pub fn generate_dockerfile(
    runtime: Runtime,
    version: &str,
    prebuild_command: &str,
    build_command: &str,
    run_command: &str,
    build_arg_keys: &[String],
    secret_keys: &[String],
) -> Result<String, DetectError> {
    let (base_image, workdir, expose) = match runtime {
        Runtime::Node => (format!("node:{}-alpine", version), "/app", 3000),
        Runtime::Python => (format!("python:{}-slim", version), "/app", 8000),
        Runtime::Go => (format!("golang:{}-alpine", version), "/app", 8080),
        Runtime::Bun => (format!("oven/bun:{}", version), "/app", 3000),
        Runtime::Java => (
            java_base_image(version, prebuild_command, build_command, run_command),
            "/app",
            8080,
        ),
        Runtime::Static => ("nginx:alpine".to_string(), "/usr/share/nginx/html", 80),
        Runtime::Php | Runtime::Unknown => {
            return Err(DetectError::UnsupportedRuntime(runtime.to_string()));
        }
    };

    let mut lines: Vec<String> = Vec::new();
    lines.push(format!("FROM {}", base_image));
    lines.push(String::new());
    lines.push(format!("WORKDIR {}", workdir));
    lines.push(String::new());

    let arg_keys: BTreeSet<&String> = build_arg_keys.iter().collect();
    if !arg_keys.is_empty() {
        for key in &arg_keys {
            lines.push(format!("ARG {}", key));
        }
        lines.push(String::new());
    }

    lines.push("COPY . .".to_string());
    lines.push(String::new());

    let mut emitted_run = false;
    for command in [prebuild_command, build_command] {
        if command.trim().is_empty() {
            continue;
        }
        lines.push(run_line(command, secret_keys));
        emitted_run = true;
    }
    if emitted_run {
        lines.push(String::new());
    }

    lines.push(format!("EXPOSE {}", expose));

    if runtime == Runtime::Static {
        lines.push(String::new());
        lines.push(r#"CMD ["nginx", "-g", "daemon off;"]"#.to_string());
    } else if !run_command.trim().is_empty() {
        lines.push(String::new());
        lines.push(format!("CMD {}", run_command));
    }

    Ok(normalize(&lines))
}

/// Java picks its image from the build tool the commands mention.
fn java_base_image(version: &str, prebuild: &str, build: &str, run: &str) -> String {
    let commands = format!("{} {} {}", prebuild, build, run);
    if commands.contains("mvn") {
        return format!("maven:3.9-eclipse-temurin-{}", version);
    }
    if commands.contains("gradle") {
        return format!("gradle:8-jdk{}", version);
    }
    format!("eclipse-temurin:{}-jdk", version)
}

/// A RUN line; when secrets exist the command runs inside a `set -e`
/// wrapper that mounts each secret by id and exports it into the
/// environment.
fn run_line(command: &str, secret_keys: &[String]) -> String {
    if secret_keys.is_empty() {
        return format!("RUN {}", command);
    }

    let mounts: String = secret_keys
        .iter()
        .map(|key| format!("--mount=type=secret,id={} ", key))
        .collect();
    let exports: String = secret_keys
        .iter()
        .map(|key| format!("export {}=\"$(cat {}/{})\"; ", key, SECRETS_DIR, key))
        .collect();
    let wrapper = format!("set -e; {}{}", exports, command);

    format!("RUN {}sh -c '{}'", mounts, escape_single_quotes(&wrapper))
}

fn escape_single_quotes(value: &str) -> String {
    value.replace('\'', r"'\''")
}

/// Strip trailing whitespace per line and end with exactly one newline.
fn normalize(lines: &[String]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(line.trim_end());
        out.push('\n');
    }
    while out.ends_with("\n\n") {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_node_recipe_shape() {
        let content = generate_dockerfile(
            Runtime::Node,
            "22",
            "npm ci",
            "npm run build",
            "npm start",
            &[],
            &[],
        )
        .unwrap();

        assert!(content.starts_with("FROM node:22-alpine\n"));
        assert!(content.contains("WORKDIR /app"));
        assert!(content.contains("COPY . ."));
        assert!(content.contains("RUN npm ci"));
        assert!(content.contains("RUN npm run build"));
        assert!(content.contains("EXPOSE 3000"));
        assert!(content.contains("CMD npm start"));
        assert!(content.ends_with('\n'));
        assert!(!content.ends_with("\n\n"));
    }

    #[test]
    fn test_empty_build_slot_emits_no_run_line() {
        let content = generate_dockerfile(
            Runtime::Node,
            "22",
            "pnpm install",
            "",
            "pnpm run serve",
            &[],
            &[],
        )
        .unwrap();

        assert!(content.contains("RUN pnpm install"));
        assert!(!content.contains("RUN pnpm run build"));
        assert_eq!(content.matches("RUN ").count(), 1);
    }

    #[test]
    fn test_build_args_sorted_and_deduplicated() {
        let content = generate_dockerfile(
            Runtime::Node,
            "22",
            "npm ci",
            "",
            "npm start",
            &keys(&["ZED", "ALPHA", "ZED", "MID"]),
            &[],
        )
        .unwrap();

        let arg_lines: Vec<&str> = content
            .lines()
            .filter(|line| line.starts_with("ARG "))
            .collect();
        assert_eq!(arg_lines, vec!["ARG ALPHA", "ARG MID", "ARG ZED"]);
    }

    #[test]
    fn test_secret_mounts_and_wrapper() {
        let content = generate_dockerfile(
            Runtime::Node,
            "22",
            "npm ci",
            "npm run build",
            "npm start",
            &[],
            &keys(&["API_TOKEN", "DB_PASSWORD"]),
        )
        .unwrap();

        let prebuild_line = content
            .lines()
            .find(|line| line.contains("npm ci"))
            .unwrap();
        assert!(prebuild_line.contains("--mount=type=secret,id=API_TOKEN"));
        assert!(prebuild_line.contains("--mount=type=secret,id=DB_PASSWORD"));
        assert!(prebuild_line.contains("set -e;"));
        assert!(prebuild_line.contains("export API_TOKEN=\"$(cat /run/secrets/API_TOKEN)\";"));
        // Both build steps get the mounts.
        assert_eq!(content.matches("--mount=type=secret,id=API_TOKEN").count(), 2);
        // Secret values never appear; only ids.
        assert!(!content.contains("abc123"));
    }

    #[test]
    fn test_single_quotes_in_command_are_escaped() {
        let content = generate_dockerfile(
            Runtime::Node,
            "22",
            "echo 'hi'",
            "",
            "npm start",
            &[],
            &keys(&["TOKEN"]),
        )
        .unwrap();

        assert!(content.contains(r"echo '\''hi'\''"));
    }

    #[test]
    fn test_java_maven_base_image() {
        let content = generate_dockerfile(
            Runtime::Java,
            "17",
            "mvn clean",
            "mvn install -DskipTests",
            "java -jar target/*.jar",
            &[],
            &[],
        )
        .unwrap();
        assert!(content.starts_with("FROM maven:3.9-eclipse-temurin-17\n"));
        assert!(content.contains("EXPOSE 8080"));
    }

    #[test]
    fn test_java_gradle_wrapper_base_image() {
        let content = generate_dockerfile(
            Runtime::Java,
            "17",
            "./gradlew dependencies",
            "./gradlew build -x test",
            "java -jar build/libs/*.jar",
            &[],
            &[],
        )
        .unwrap();
        assert!(content.starts_with("FROM gradle:8-jdk17\n"));
    }

    #[test]
    fn test_java_fallback_base_image() {
        let content =
            generate_dockerfile(Runtime::Java, "21", "", "", "java -jar app.jar", &[], &[])
                .unwrap();
        assert!(content.starts_with("FROM eclipse-temurin:21-jdk\n"));
    }

    #[test]
    fn test_static_recipe() {
        let content =
            generate_dockerfile(Runtime::Static, "latest", "", "", "", &[], &[]).unwrap();
        assert!(content.starts_with("FROM nginx:alpine\n"));
        assert!(content.contains("WORKDIR /usr/share/nginx/html"));
        assert!(content.contains("EXPOSE 80"));
        assert!(content.contains(r#"CMD ["nginx", "-g", "daemon off;"]"#));
    }

    #[test]
    fn test_go_recipe() {
        let content = generate_dockerfile(
            Runtime::Go,
            "1.18",
            "go mod download",
            "go build -o app ./cmd/api",
            "./app",
            &[],
            &[],
        )
        .unwrap();
        assert!(content.starts_with("FROM golang:1.18-alpine\n"));
        assert!(content.contains("EXPOSE 8080"));
        assert!(content.contains("CMD ./app"));
    }

    #[test]
    fn test_bun_recipe() {
        let content = generate_dockerfile(
            Runtime::Bun,
            "1.2",
            "bun install",
            "bun run build",
            "bun run start",
            &[],
            &[],
        )
        .unwrap();
        assert!(content.starts_with("FROM oven/bun:1.2\n"));
        assert!(content.contains("EXPOSE 3000"));
    }

    #[test]
    fn test_unsupported_runtimes_error() {
        assert!(generate_dockerfile(Runtime::Php, "8", "", "", "", &[], &[]).is_err());
        assert!(generate_dockerfile(Runtime::Unknown, "", "", "", "", &[], &[]).is_err());
    }

    #[test]
    fn test_trailing_whitespace_normalized() {
        let content = generate_dockerfile(
            Runtime::Node,
            "22",
            "npm ci   ",
            "",
            "npm start",
            &[],
            &[],
        )
        .unwrap();
        assert!(!content.lines().any(|line| line.ends_with(' ')));
        assert!(content.ends_with('\n'));
    }
}
