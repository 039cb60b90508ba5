use std::sync::atomic::{AtomicU64, Ordering};

use redis::Script;
use tokio::sync::Mutex;

use crate::{
    AdmissionError,
    redis::{clock::lua_clock, connection::StoreConnection},
};

// GCRA shared by both rate scripts. All times are microseconds; the stored value is
// the theoretical arrival time (TAT). `debt` is how far the TAT runs ahead of now.
// A tolerance of 1µs, or half an interval when that is smaller, absorbs the rounding
// of the stored TAT without ever adding a whole unit of capacity.
macro_rules! lua_gcra_prelude {
    () => {
        r#"
    local bucket_key = KEYS[1]
    local burst = tonumber(ARGV[1])
    local interval_us = tonumber(ARGV[2])
    local cost = tonumber(ARGV[3])

    local burst_offset = interval_us * burst
    local tolerance = math.min(1, interval_us / 2)
    local tat = tonumber(redis.call("GET", bucket_key)) or now_us
    local debt = math.max(tat - now_us, 0)

    local function units_left(d)
        local left = math.floor((burst_offset - d + tolerance) / interval_us)
        return math.max(math.min(left, burst), 0)
    end

    local function store(new_debt)
        redis.call("SET", bucket_key, string.format("%.3f", now_us + new_debt), "PX", string.format("%d", math.ceil(new_debt / 1000)))
    end

    if cost == 0 then
        return {0, units_left(debt), -1, math.ceil(debt)}
    end
"#
    };
}

const ALLOW_N_SCRIPT: &str = concat!(
    lua_clock!(),
    lua_gcra_prelude!(),
    r#"
    local new_debt = debt + cost * interval_us

    if new_debt > burst_offset + tolerance then
        return {0, units_left(debt), math.ceil(new_debt - burst_offset), math.ceil(debt)}
    end

    store(new_debt)

    return {cost, units_left(new_debt), -1, math.ceil(new_debt)}
"#
);

const ALLOW_AT_MOST_SCRIPT: &str = concat!(
    lua_clock!(),
    lua_gcra_prelude!(),
    r#"
    local available = units_left(debt)

    if available < 1 then
        return {0, 0, math.ceil(debt + interval_us - burst_offset), math.ceil(debt)}
    end

    local granted = math.min(cost, available)
    local new_debt = debt + granted * interval_us

    store(new_debt)

    local retry_after_us = -1
    if granted < cost then
        retry_after_us = math.max(math.ceil(new_debt + interval_us - burst_offset), 0)
    end

    return {granted, units_left(new_debt), retry_after_us, math.ceil(new_debt)}
"#
);

// Slot set: hash of request id -> expiration (ms since the clock epoch). Expired
// entries are reaped while counting. A live holder taking again only refreshes its
// entry, but is refused like anyone else once the key is at capacity.
const CONCURRENCY_TAKE_SCRIPT: &str = concat!(
    lua_clock!(),
    r#"
    local slots_key = KEYS[1]
    local request_id = ARGV[1]
    local max = tonumber(ARGV[2])
    local hold_ms = tonumber(ARGV[3])

    local now_ms = math.floor(now_us / 1000)

    local entries = redis.call("HGETALL", slots_key)
    local used = 0
    local held = false
    local soonest = -1

    for i = 1, #entries, 2 do
        local expires_at = tonumber(entries[i + 1])

        if expires_at == nil or expires_at <= now_ms then
            redis.call("HDEL", slots_key, entries[i])
        else
            used = used + 1
            if entries[i] == request_id then
                held = true
            end
            if soonest < 0 or expires_at < soonest then
                soonest = expires_at
            end
        end
    end

    if used >= max then
        local retry_after_ms = hold_ms
        if soonest >= 0 then
            retry_after_ms = math.min(soonest - now_ms, hold_ms)
        end

        return {0, used, retry_after_ms}
    end

    redis.call("HSET", slots_key, request_id, string.format("%d", now_ms + hold_ms))
    redis.call("PEXPIRE", slots_key, string.format("%d", hold_ms * 5))

    if not held then
        used = used + 1
    end

    return {1, used, -1}
"#
);

/// The Lua scripts the limiters run, and the bookkeeping for loading them.
///
/// Scripts are addressed by the SHA1 of their source. Redis may drop them at any time
/// (restart, `SCRIPT FLUSH`, failover), so [`ScriptRegistry::reload`] is called
/// whenever a round trip finds one missing. Each successful load bumps a generation
/// counter; callers pass the generation they observed so that concurrent callers
/// hitting the same eviction load the scripts once.
pub(crate) struct ScriptRegistry {
    allow_n: Script,
    allow_at_most: Script,
    concurrency_take: Script,
    generation: AtomicU64,
    reload_lock: Mutex<()>,
}

impl ScriptRegistry {
    pub(crate) fn new() -> Self {
        Self {
            allow_n: Script::new(ALLOW_N_SCRIPT),
            allow_at_most: Script::new(ALLOW_AT_MOST_SCRIPT),
            concurrency_take: Script::new(CONCURRENCY_TAKE_SCRIPT),
            generation: AtomicU64::new(0),
            reload_lock: Mutex::new(()),
        }
    }

    pub(crate) fn allow_n(&self) -> &Script {
        &self.allow_n
    }

    pub(crate) fn allow_at_most(&self) -> &Script {
        &self.allow_at_most
    }

    pub(crate) fn concurrency_take(&self) -> &Script {
        &self.concurrency_take
    }

    fn all(&self) -> [&Script; 3] {
        [&self.allow_n, &self.allow_at_most, &self.concurrency_take]
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Register every script with Redis.
    pub(crate) async fn load(&self, connection: &StoreConnection) -> Result<(), AdmissionError> {
        let _guard = self.reload_lock.lock().await;
        self.load_locked(connection).await
    }

    /// Register every script again, unless another caller already did so after
    /// `observed_generation`.
    pub(crate) async fn reload(
        &self,
        observed_generation: u64,
        connection: &StoreConnection,
    ) -> Result<(), AdmissionError> {
        let _guard = self.reload_lock.lock().await;

        if self.generation() != observed_generation {
            tracing::debug!(
                observed_generation,
                "redis.scripts.reload, already reloaded by a concurrent caller"
            );
            return Ok(());
        }

        self.load_locked(connection).await
    }

    async fn load_locked(&self, connection: &StoreConnection) -> Result<(), AdmissionError> {
        let mut pipe = redis::Pipeline::new();
        for script in self.all() {
            pipe.load_script(script);
        }

        let hashes: Vec<String> = connection.query_pipeline(&pipe).await?;

        if hashes.len() != self.all().len() {
            return Err(AdmissionError::ProtocolViolation(format!(
                "SCRIPT LOAD returned {} hashes for {} scripts",
                hashes.len(),
                self.all().len()
            )));
        }

        for (script, hash) in self.all().into_iter().zip(&hashes) {
            if !script.get_hash().eq_ignore_ascii_case(hash) {
                return Err(AdmissionError::ProtocolViolation(format!(
                    "SCRIPT LOAD returned {hash}, expected {}",
                    script.get_hash()
                )));
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(generation, "redis.scripts.load, scripts loaded");

        Ok(())
    }
}
