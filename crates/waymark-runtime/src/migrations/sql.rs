//! SQL file units.
//!
//! Each `<index>_<description>.sql` file in a directory becomes one unit whose
//! statements run inside a single transaction.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use waymark_core::error::{MigrateError, Result};
use waymark_core::unit::{Source, Unit, UnitContext};

/// Directory scanned when none is given.
pub const DEFAULT_SOURCE_DIR: &str = "./migrations";

/// A source producing one unit per `.sql` file in a directory.
pub struct SqlDirSource {
    pool: PgPool,
    dir: PathBuf,
    name: String,
    /// `None` until the directory has been scanned once.
    units: Mutex<Option<Vec<Arc<dyn Unit>>>>,
}

impl SqlDirSource {
    /// Create a source reading from `dir`. An empty path means `./migrations`.
    pub fn new(pool: PgPool, dir: impl Into<PathBuf>) -> Self {
        let mut dir = dir.into();
        if dir.as_os_str().is_empty() {
            dir = PathBuf::from(DEFAULT_SOURCE_DIR);
        }
        let name = format!("sql:{}", dir.display());

        Self {
            pool,
            dir,
            name,
            units: Mutex::new(None),
        }
    }

    /// Directory this source reads from.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn load(&self) -> Result<Vec<Arc<dyn Unit>>> {
        let files = scan_dir(&self.dir).map_err(|e| match e {
            MigrateError::Discovery { .. } => e,
            other => MigrateError::discovery(&self.name, other.to_string()),
        })?;

        let units = files
            .into_iter()
            .map(|file| {
                let sql = std::fs::read_to_string(&file.path).map_err(|e| {
                    MigrateError::discovery(
                        &self.name,
                        format!("Failed to read {}: {}", file.path.display(), e),
                    )
                })?;
                Ok(Arc::new(SqlUnit {
                    index: file.index,
                    name: file.name,
                    sql,
                    pool: self.pool.clone(),
                }) as Arc<dyn Unit>)
            })
            .collect::<Result<Vec<_>>>()?;

        debug!("Loaded {} SQL units from {:?}", units.len(), self.dir);
        Ok(units)
    }
}

impl Source for SqlDirSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_units(&self) -> Pin<Box<dyn Future<Output = Result<Vec<Arc<dyn Unit>>>> + Send + '_>> {
        Box::pin(async move {
            let mut cached = self.units.lock().await;
            if let Some(units) = cached.as_ref() {
                return Ok(units.clone());
            }

            let units = self.load()?;
            *cached = Some(units.clone());
            Ok(units)
        })
    }
}

/// A migration file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlFile {
    pub index: u32,
    /// File stem, e.g. `0002_add_posts`.
    pub name: String,
    pub path: PathBuf,
}

/// List the migration files in `dir`.
///
/// A missing directory yields nothing. Non-`.sql` files are ignored;
/// subdirectories and files without a numeric prefix are errors.
pub fn scan_dir(dir: &Path) -> Result<Vec<SqlFile>> {
    if !dir.exists() {
        debug!("Migrations directory does not exist: {:?}", dir);
        return Ok(Vec::new());
    }

    let source_name = format!("sql:{}", dir.display());
    let mut files = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if entry.file_type()?.is_dir() {
            return Err(MigrateError::discovery(
                &source_name,
                format!("Unexpected directory {}", path.display()),
            ));
        }
        if path.extension().map(|e| e != "sql").unwrap_or(true) {
            continue;
        }

        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                MigrateError::discovery(
                    &source_name,
                    format!("Invalid migration filename {}", path.display()),
                )
            })?
            .to_string();
        let index = parse_index(&name).ok_or_else(|| {
            MigrateError::discovery(
                &source_name,
                format!("Migration filename {:?} has no numeric index prefix", name),
            )
        })?;

        files.push(SqlFile { index, name, path });
    }

    files.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.name.cmp(&b.name)));
    Ok(files)
}

/// Index prefix of a file stem: `0007_add_users` → 7, `12` → 12.
fn parse_index(stem: &str) -> Option<u32> {
    let prefix = stem.split('_').next()?;
    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    prefix.parse().ok()
}

/// A unit that runs the statements of one SQL file in a transaction.
pub struct SqlUnit {
    index: u32,
    name: String,
    sql: String,
    pool: PgPool,
}

impl SqlUnit {
    /// Build a unit from SQL text directly.
    pub fn new(index: u32, name: impl Into<String>, sql: impl Into<String>, pool: PgPool) -> Self {
        Self {
            index,
            name: name.into(),
            sql: sql.into(),
            pool,
        }
    }

    /// Raw SQL of this unit.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    async fn apply(&self, ctx: UnitContext) -> Result<()> {
        let statements = split_statements(&self.sql);
        if statements.is_empty() {
            debug!("Unit {} ({}) has no statements", self.index, self.name);
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for statement in &statements {
            if ctx.is_cancelled() {
                rollback(tx, self.index).await;
                return Err(MigrateError::Execution(format!(
                    "{} cancelled before completion",
                    self.name
                )));
            }

            if let Err(e) = sqlx::query(statement).execute(&mut *tx).await {
                rollback(tx, self.index).await;
                return Err(MigrateError::Execution(format!(
                    "{} failed: {}; statement: {}",
                    self.name, e, statement
                )));
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

async fn rollback(tx: sqlx::Transaction<'_, sqlx::Postgres>, index: u32) {
    if let Err(e) = tx.rollback().await {
        warn!("Failed to roll back unit {}: {}", index, e);
    }
}

impl Unit for SqlUnit {
    fn index(&self) -> u32 {
        self.index
    }

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn execute(&self, ctx: UnitContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(self.apply(ctx))
    }
}

/// Split SQL text into statements.
///
/// Semicolons inside string literals, quoted identifiers, `--` and `/* */`
/// comments, and dollar-quoted bodies (`$$ ... $$`, `$tag$ ... $tag$`) do not
/// end a statement. Comment-only fragments are dropped.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                // E'...' strings allow backslash escapes.
                let backslash_escapes = c == '\'' && has_escape_prefix(&current);
                current.push(c);
                while let Some(next) = chars.next() {
                    current.push(next);
                    if backslash_escapes && next == '\\' {
                        if let Some(escaped) = chars.next() {
                            current.push(escaped);
                        }
                        continue;
                    }
                    if next == c {
                        // Doubled quote is an escaped quote.
                        if chars.peek() == Some(&c) {
                            current.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                current.push(c);
                for next in chars.by_ref() {
                    current.push(next);
                    if next == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                current.push(c);
                if let Some(star) = chars.next() {
                    current.push(star);
                }
                let mut prev = '\0';
                for next in chars.by_ref() {
                    current.push(next);
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            // `$` inside an identifier such as `a$b` is not a quote.
            '$' if current.chars().next_back().is_some_and(is_ident_char) => current.push(c),
            '$' => {
                current.push(c);
                let mut tag = String::from("$");
                while let Some(&next) = chars.peek() {
                    if next == '$' {
                        tag.push(next);
                        current.push(next);
                        chars.next();
                        break;
                    } else if next.is_alphanumeric() || next == '_' {
                        tag.push(next);
                        current.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }

                // `$1` style parameters never close with a second `$`.
                if tag.len() >= 2 && tag.ends_with('$') {
                    let body_start = current.len();
                    for next in chars.by_ref() {
                        current.push(next);
                        if next == '$'
                            && current.len() >= body_start + tag.len()
                            && current[body_start..].ends_with(&tag)
                        {
                            break;
                        }
                    }
                }
            }
            ';' => {
                push_statement(&mut statements, &current);
                current.clear();
            }
            _ => current.push(c),
        }
    }

    push_statement(&mut statements, &current);
    statements
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Whether `sql` ends with a standalone `E`/`e` string prefix.
fn has_escape_prefix(sql: &str) -> bool {
    let mut rev = sql.chars().rev();
    matches!(rev.next(), Some('e' | 'E')) && !rev.next().is_some_and(is_ident_char)
}

fn push_statement(statements: &mut Vec<String>, fragment: &str) {
    let statement = fragment.trim();
    let only_comments = statement.lines().all(|l| {
        let l = l.trim();
        l.is_empty() || l.starts_with("--")
    });
    if !statement.is_empty() && !only_comments {
        statements.push(statement.to_string());
    }
}
