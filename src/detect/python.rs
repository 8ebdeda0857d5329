//! Python command detection: dependency-manager prebuild, `setup.py`
//! build, and entrypoint discovery across Django, ASGI, FastAPI,
//! Gunicorn/WSGI, plain scripts, and `python -m` packages.

use std::path::Path;

use crate::allowlist::AllowedCommands;

use super::{file_exists, pick_first_allowed};

pub(super) fn detect_python_commands(
    repo: &Path,
    allowed: &AllowedCommands,
) -> (String, String, String) {
    let prebuild = prebuild_candidates(repo);
    let build = build_candidates(repo);
    let run = run_candidates(repo);

    (
        pick_first_allowed(&prebuild, &allowed.prebuild),
        pick_first_allowed(&build, &allowed.build),
        pick_first_allowed(&run, &allowed.run),
    )
}

fn prebuild_candidates(repo: &Path) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::new();
    let mut add = |cmd: &str, candidates: &mut Vec<String>| {
        if cmd.is_empty() || candidates.iter().any(|c| c == cmd) {
            return;
        }
        candidates.push(cmd.to_string());
    };

    if file_exists(&repo.join("requirements.txt")) {
        add("pip install -r requirements.txt", &mut candidates);
    }
    if file_exists(&repo.join("Pipfile")) {
        add(
            "pip install pipenv && pipenv install --system --deploy",
            &mut candidates,
        );
    }
    if file_exists(&repo.join("pyproject.toml")) || file_exists(&repo.join("setup.py")) {
        add("pip install .", &mut candidates);
    }

    candidates
}

fn build_candidates(repo: &Path) -> Vec<String> {
    if file_exists(&repo.join("setup.py")) {
        vec!["python setup.py build".to_string()]
    } else {
        Vec::new()
    }
}

fn run_candidates(repo: &Path) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::new();
    let mut add = |cmd: String, candidates: &mut Vec<String>| {
        if cmd.is_empty() || candidates.iter().any(|c| *c == cmd) {
            return;
        }
        candidates.push(cmd);
    };

    if file_exists(&repo.join("manage.py")) {
        add(
            "python manage.py runserver 0.0.0.0:${PORT:-8000}".to_string(),
            &mut candidates,
        );
        add("python manage.py".to_string(), &mut candidates);
    }

    if let Some(cmd) = detect_asgi_run_command(repo) {
        add(cmd, &mut candidates);
    }
    if let Some(cmd) = detect_fastapi_run_command(repo) {
        add(cmd, &mut candidates);
    }
    if let Some(cmd) = detect_gunicorn_run_command(repo) {
        add(cmd, &mut candidates);
    }

    for file in ["main.py", "app.py", "server.py", "run.py"] {
        if file_exists(&repo.join(file)) {
            add(format!("python {}", file), &mut candidates);
        }
    }

    if let Some(module) = detect_python_main_module(repo) {
        add(format!("python -m {}", module), &mut candidates);
    }

    if candidates.is_empty() {
        add("python main.py".to_string(), &mut candidates);
    }

    candidates
}

fn detect_fastapi_run_command(repo: &Path) -> Option<String> {
    const CANDIDATES: &[&str] = &[
        "main.py",
        "app.py",
        "server.py",
        "src/main.py",
        "src/app.py",
        "src/server.py",
    ];

    for path in CANDIDATES {
        let Ok(text) = std::fs::read_to_string(repo.join(path)) else {
            continue;
        };
        let lower = text.to_lowercase();
        if !lower.contains("fastapi") && !lower.contains("starlette") {
            continue;
        }

        let mut app_name = detect_assigned_name(&text, "FastAPI(", "");
        if app_name.is_empty() {
            app_name = detect_assigned_name(&text, "Starlette(", "app");
        }
        if app_name.is_empty() {
            app_name = "app".to_string();
        }

        let module = python_module_from_path(path)?;
        return Some(format!(
            "uvicorn {}:{} --host 0.0.0.0 --port ${{PORT:-8000}}",
            module, app_name
        ));
    }

    None
}

fn detect_asgi_run_command(repo: &Path) -> Option<String> {
    const CANDIDATES: &[&str] = &["asgi.py", "src/asgi.py"];

    for path in CANDIDATES {
        let Ok(text) = std::fs::read_to_string(repo.join(path)) else {
            continue;
        };
        if !text.to_lowercase().contains("application") {
            continue;
        }

        let module = python_module_from_path(path)?;
        return Some(format!(
            "uvicorn {}:application --host 0.0.0.0 --port ${{PORT:-8000}}",
            module
        ));
    }

    None
}

fn detect_gunicorn_run_command(repo: &Path) -> Option<String> {
    const CANDIDATES: &[&str] = &[
        "wsgi.py",
        "app.py",
        "main.py",
        "server.py",
        "src/wsgi.py",
        "src/app.py",
    ];

    for path in CANDIDATES {
        let Ok(text) = std::fs::read_to_string(repo.join(path)) else {
            continue;
        };
        let lower = text.to_lowercase();
        let Some(module) = python_module_from_path(path) else {
            continue;
        };

        if lower.contains("flask") {
            let mut app_name = detect_assigned_name(&text, "Flask(", "app");
            if app_name.is_empty() {
                app_name = "app".to_string();
            }
            return Some(format!(
                "gunicorn {}:{} --bind 0.0.0.0:${{PORT:-8000}}",
                module, app_name
            ));
        }

        let is_wsgi_module = module == "wsgi" || module.ends_with(".wsgi");
        if lower.contains("application")
            && (is_wsgi_module || lower.contains("wsgi") || lower.contains("django.core.wsgi"))
        {
            return Some(format!(
                "gunicorn {}:application --bind 0.0.0.0:${{PORT:-8000}}",
                module
            ));
        }
    }

    None
}

/// Find `name = Constructor(...)` and return `name` when it is a valid
/// identifier; otherwise the fallback.
fn detect_assigned_name(source: &str, constructor: &str, fallback: &str) -> String {
    for line in source.lines() {
        let trimmed = line.trim();
        if !trimmed.contains('=') || !trimmed.contains(constructor) {
            continue;
        }
        let left = trimmed.splitn(2, '=').next().unwrap_or("").trim();
        if is_python_identifier(left) {
            return left.to_string();
        }
    }
    fallback.to_string()
}

/// Find a runnable package: a top-level directory with `__main__.py`, or
/// (when packaging metadata exists) one under `src/`.
fn detect_python_main_module(repo: &Path) -> Option<String> {
    if let Some(name) = main_module_in(repo) {
        return Some(name);
    }

    if !file_exists(&repo.join("pyproject.toml")) && !file_exists(&repo.join("setup.py")) {
        return None;
    }
    main_module_in(&repo.join("src"))
}

fn main_module_in(dir: &Path) -> Option<String> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty() && !name.starts_with('.'))
        .collect();
    names.sort_by_key(|name| name.to_lowercase());

    names
        .into_iter()
        .filter(|name| is_python_identifier(name))
        .find(|name| file_exists(&dir.join(name).join("__main__.py")))
}

fn is_python_identifier(value: &str) -> bool {
    let value = value.trim();
    if value.is_empty() {
        return false;
    }
    for (i, c) in value.chars().enumerate() {
        match c {
            '_' => {}
            'a'..='z' | 'A'..='Z' => {}
            '0'..='9' => {
                if i == 0 {
                    return false;
                }
            }
            _ => return false,
        }
    }
    true
}

/// `src/app.py` → `src.app`; every segment must be a valid identifier.
fn python_module_from_path(path: &str) -> Option<String> {
    let path = path
        .trim()
        .trim_end_matches(".py")
        .trim_matches('/')
        .replace('\\', "/");
    if path.is_empty() {
        return None;
    }

    let mut parts = Vec::new();
    for part in path.split('/') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if !is_python_identifier(part) {
            return None;
        }
        parts.push(part);
    }
    Some(parts.join("."))
}
