use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::document::Status;
use crate::error::{IdentityError, IdentityResult};
use crate::names::{compose_filename, normalize, EMPTY_COMPONENT, SHORT_ID_LEN};

/// Default number of draws before giving up on a unique short id.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Format of the timestamp component embedded in filenames.
pub const FILENAME_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Source of 8-character short ids.
pub trait ShortIdSource: Send + Sync {
    /// Draw a candidate id. Must be 8 lowercase hex characters.
    fn draw(&self) -> String;
}

/// Short ids taken from the leading hex digits of a random v4 UUID.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomShortIds;

impl ShortIdSource for RandomShortIds {
    fn draw(&self) -> String {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(SHORT_ID_LEN);
        id
    }
}

/// Replays a fixed list of ids, then falls back to random draws.
///
/// Used to force a specific identity (and therefore a specific collision)
/// in tests and replay tooling.
#[derive(Default)]
pub struct ScriptedShortIds {
    queue: Mutex<VecDeque<String>>,
}

impl ScriptedShortIds {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queue: Mutex::new(ids.into_iter().map(Into::into).collect()),
        }
    }

    /// Append more ids to replay.
    pub fn push(&self, id: impl Into<String>) {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(id.into());
    }

    /// Number of scripted ids not yet drawn.
    pub fn remaining(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl ShortIdSource for ScriptedShortIds {
    fn draw(&self) -> String {
        let next = self
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        next.unwrap_or_else(|| RandomShortIds.draw())
    }
}

impl fmt::Debug for ScriptedShortIds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedShortIds")
            .field("remaining", &self.remaining())
            .finish()
    }
}

/// Wall-clock source.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system UTC clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = *guard + by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Result of [`IdentityGenerator::generate`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedName {
    /// Full filename including `.json`.
    pub filename: String,
    /// The 8-character short id (last component).
    pub short_id: String,
    /// The `YYYYMMDD_HHMMSS` component.
    pub timestamp: String,
}

impl GeneratedName {
    /// Filename without the `.json` extension; the draft id of a draft.
    pub fn basename(&self) -> &str {
        self.filename
            .strip_suffix(crate::names::RECORD_EXTENSION)
            .unwrap_or(&self.filename)
    }
}

/// Mints record filenames and short ids.
///
/// The generator is cheap to clone; the entropy source and clock are shared.
#[derive(Clone)]
pub struct IdentityGenerator {
    max_attempts: u32,
    ids: Arc<dyn ShortIdSource>,
    clock: Arc<dyn Clock>,
}

impl IdentityGenerator {
    /// A generator backed by random UUIDs and the system clock.
    pub fn new() -> Self {
        Self::with_sources(Arc::new(RandomShortIds), Arc::new(SystemClock))
    }

    pub fn with_sources(ids: Arc<dyn ShortIdSource>, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            ids,
            clock,
        }
    }

    /// Override the retry budget. A budget of zero is raised to one.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Generate a record filename using the current clock time.
    ///
    /// `fallback_ids` supplies, per position, a schema field id used when the
    /// matching variable is blank. `exists` receives every candidate filename;
    /// returning `true` forces a redraw of the short id.
    pub fn generate(
        &self,
        status: &str,
        username: &str,
        variables: &[String],
        fallback_ids: &[String],
        exists: Option<&dyn Fn(&str) -> bool>,
    ) -> IdentityResult<GeneratedName> {
        self.generate_at(
            status,
            username,
            variables,
            fallback_ids,
            self.clock.now(),
            exists,
        )
    }

    /// Generate a record filename for an explicit instant.
    pub fn generate_at(
        &self,
        status: &str,
        username: &str,
        variables: &[String],
        fallback_ids: &[String],
        now: DateTime<Utc>,
        exists: Option<&dyn Fn(&str) -> bool>,
    ) -> IdentityResult<GeneratedName> {
        let status: Status = status.parse()?;

        let components: Vec<String> = variables
            .iter()
            .enumerate()
            .map(|(i, var)| {
                let value = normalize(var);
                if !value.is_empty() {
                    return value;
                }
                match fallback_ids.get(i).map(|f| normalize(f)) {
                    Some(fallback) if !fallback.is_empty() => {
                        debug!(position = i, field_id = %fallback, "using field id fallback");
                        fallback
                    }
                    _ => EMPTY_COMPONENT.to_string(),
                }
            })
            .collect();
        let username = non_empty_component(normalize(username));
        let timestamp = now.format(FILENAME_TIMESTAMP_FORMAT).to_string();

        let short_id = self.draw_unique("filename uuid", |candidate| match exists {
            Some(check) => check(&compose_filename(
                status,
                &username,
                &components,
                &timestamp,
                candidate,
            )),
            None => false,
        })?;

        let filename = compose_filename(status, &username, &components, &timestamp, &short_id);
        debug!(filename = %filename, "generated filename");
        Ok(GeneratedName {
            filename,
            short_id,
            timestamp,
        })
    }

    /// Generate a bare short id, e.g. for temporary upload ids.
    pub fn generate_short_id(
        &self,
        exists: Option<&dyn Fn(&str) -> bool>,
        context: &str,
    ) -> IdentityResult<String> {
        self.draw_unique(context, |candidate| exists.is_some_and(|check| check(candidate)))
    }

    fn draw_unique(&self, context: &str, collides: impl Fn(&str) -> bool) -> IdentityResult<String> {
        for attempt in 1..=self.max_attempts {
            let candidate = self.ids.draw();
            if !collides(&candidate) {
                if attempt > 1 {
                    debug!(context, attempt, id = %candidate, "resolved short id collision");
                }
                return Ok(candidate);
            }
            warn!(context, attempt, id = %candidate, "short id collision detected");
        }
        Err(IdentityError::CollisionExhausted {
            attempts: self.max_attempts,
            context: context.to_string(),
        })
    }
}

impl Default for IdentityGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for IdentityGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityGenerator")
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

/// A component that normalized to nothing is written as `empty`.
fn non_empty_component(value: String) -> String {
    if value.is_empty() {
        EMPTY_COMPONENT.to_string()
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;
    use crate::names::{is_short_id, parse_filename};

    fn fixed_generator(ids: Vec<&str>) -> IdentityGenerator {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2025, 7, 29, 12, 34, 56).unwrap());
        IdentityGenerator::with_sources(Arc::new(ScriptedShortIds::new(ids)), Arc::new(clock))
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    // ---- Filename generation ----

    #[test]
    fn generates_expected_shape() {
        let gen = fixed_generator(vec!["abc12345"]);
        let name = gen
            .generate("draft", "u1", &strings(&["p1", "pt1"]), &[], None)
            .unwrap();
        assert_eq!(name.filename, "draft-u1-p1-pt1-20250729_123456-abc12345.json");
        assert_eq!(name.basename(), "draft-u1-p1-pt1-20250729_123456-abc12345");
        assert_eq!(name.short_id, "abc12345");
        assert_eq!(name.timestamp, "20250729_123456");
    }

    #[test]
    fn rejects_unknown_status() {
        let gen = fixed_generator(vec![]);
        let err = gen.generate("archived", "u1", &[], &[], None).unwrap_err();
        assert_eq!(err, IdentityError::InvalidStatus("archived".into()));
    }

    #[test]
    fn blank_variables_use_fallback_then_empty() {
        let gen = fixed_generator(vec!["00000001"]);
        let name = gen
            .generate(
                "final",
                "Alice",
                &strings(&["  ", "", "Value-X"]),
                &strings(&["Project-ID"]),
                None,
            )
            .unwrap();
        assert_eq!(
            name.filename,
            "final-alice-project_id-empty-value_x-20250729_123456-00000001.json"
        );
    }

    #[test]
    fn random_ids_are_short_hex() {
        let id = RandomShortIds.draw();
        assert!(is_short_id(&id), "unexpected id {id}");
    }

    // ---- Collision handling ----

    #[test]
    fn redraws_on_collision() {
        let gen = fixed_generator(vec!["aaaaaaaa", "bbbbbbbb"]);
        let taken = "draft-u1-20250729_123456-aaaaaaaa.json";
        let exists = |candidate: &str| candidate == taken;
        let name = gen.generate("draft", "u1", &[], &[], Some(&exists)).unwrap();
        assert_eq!(name.short_id, "bbbbbbbb");
    }

    #[test]
    fn collision_budget_is_exact() {
        let gen = fixed_generator(vec![]).with_max_attempts(7);
        let calls = Cell::new(0u32);
        let exists = |_: &str| {
            calls.set(calls.get() + 1);
            true
        };
        let err = gen.generate("final", "u1", &[], &[], Some(&exists)).unwrap_err();
        assert_eq!(
            err,
            IdentityError::CollisionExhausted {
                attempts: 7,
                context: "filename uuid".into()
            }
        );
        assert_eq!(calls.get(), 7);
    }

    #[test]
    fn short_id_checks_bare_candidate() {
        let gen = fixed_generator(vec!["11111111", "22222222"]);
        let exists = |candidate: &str| candidate == "11111111";
        let id = gen.generate_short_id(Some(&exists), "temp file id").unwrap();
        assert_eq!(id, "22222222");
    }

    #[test]
    fn short_id_exhaustion_uses_context() {
        let gen = fixed_generator(vec![]).with_max_attempts(3);
        let exists = |_: &str| true;
        let err = gen.generate_short_id(Some(&exists), "temp file id").unwrap_err();
        assert_eq!(err.to_string(), "unable to generate unique temp file id after 3 attempts");
    }

    // ---- Clock ----

    #[test]
    fn fixed_clock_advances() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let clock = FixedClock::new(start);
        clock.advance(Duration::seconds(90));
        assert_eq!(clock.now(), start + Duration::seconds(90));
    }

    #[test]
    fn values_that_normalize_away_become_empty() {
        let gen = fixed_generator(vec!["abcd1234"]);
        let vars = vec!["---".to_string(), " ".to_string()];
        let name = gen.generate("draft", "!!", &vars, &["__".to_string()], None).unwrap();
        assert_eq!(name.filename, "draft-empty-empty-empty-20250729_123456-abcd1234.json");
    }

    // ---- Round-trip ----

    proptest! {
        #[test]
        fn generated_names_parse_back(
            user in "[A-Za-z][A-Za-z0-9 _.]{0,20}",
            vars in proptest::collection::vec("[A-Za-z0-9 _.-]{0,12}", 0..5),
        ) {
            let gen = IdentityGenerator::new();
            let name = gen.generate("final", &user, &vars, &[], None).unwrap();
            let parsed = parse_filename(&name.filename).unwrap();

            prop_assert_eq!(parsed.status, Status::Final);
            prop_assert_eq!(parsed.username, normalize(&user));
            let expected: Vec<String> = vars
                .iter()
                .map(|v| {
                    non_empty_component(normalize(v))
                })
                .collect();
            prop_assert_eq!(parsed.variables, expected);
            prop_assert_eq!(parsed.timestamp, name.timestamp);
            prop_assert_eq!(parsed.short_id, name.short_id);
        }
    }
}
