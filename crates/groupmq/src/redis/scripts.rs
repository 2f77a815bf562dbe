//! Atomic operation library.
//!
//! Every state transition runs as a single Lua script so concurrent
//! workers can never observe a half-applied move. All scripts receive the
//! same canonical KEYS table (see `RedisKeys::canonical`) plus the key
//! prefix as `ARGV[1]`; per-job and per-group keys are derived inside the
//! script. Scripts return small integer codes on faults: -1 missing job,
//! -2 missing lock, -3 not in the expected collection, -6 token mismatch,
//! -7 duplicate id, -8 active jobs present.

use redis::Script;

/// Shared prelude: named KEYS, derived-key builders and the group
/// scheduling helpers. Concatenated ahead of every script body.
const CORE_HELPERS: &str = r#"
local kWait = KEYS[1]
local kActive = KEYS[2]
local kPrioritized = KEYS[3]
local kDelayed = KEYS[4]
local kCompleted = KEYS[5]
local kFailed = KEYS[6]
local kWaitingChildren = KEYS[7]
local kGroups = KEYS[8]
local kGroupsLimit = KEYS[9]
local kGroupsMax = KEYS[10]
local kGroupsPaused = KEYS[11]
local kGroupsActive = KEYS[12]
local kGroupsConcurrency = KEYS[13]
local kGroupsRep = KEYS[14]
local kGroupsRate = KEYS[15]
local kEvents = KEYS[16]
local kIdCounter = KEYS[17]
local kSeqCounter = KEYS[18]
local kMeta = KEYS[19]

local prefix = ARGV[1]

local function jobKey(id) return prefix .. id end
local function lockKey(id) return prefix .. id .. ':lock' end
local function depsKey(id) return prefix .. id .. ':deps' end
local function processedKey(id) return prefix .. id .. ':processed' end
local function backlogKey(gid) return prefix .. 'group:' .. gid end

local function emit(event, ...)
  local fields = {...}
  redis.call('XADD', kEvents, 'MAXLEN', '~', '10000', '*', 'event', event, unpack(fields))
end

local function delayedScore(due, id)
  local tail = 0
  local n = tonumber(id)
  if n then tail = n % 4096 end
  return due * 4096 + tail
end

-- Order score packs priority and the add-time sequence into one number.
-- LIFO jobs subtract the sequence so newer jobs sort ahead of older ones
-- within the same priority.
local function orderScore(priority, seq, lifo)
  local base = priority * 4294967296
  local tail = seq % 4294967296
  if lifo == 1 then return base - tail end
  return base + tail
end

local function pushWait(id, lifo)
  if lifo == 1 then
    redis.call('RPUSH', kWait, id)
  else
    redis.call('LPUSH', kWait, id)
  end
end

local function groupCap(gid)
  local cap = redis.call('HGET', kGroupsConcurrency, gid)
  if cap then return tonumber(cap) end
  return nil
end

local function groupRunning(gid)
  return tonumber(redis.call('HGET', kGroupsActive, gid) or '0')
end

local function becomeRep(gid, id, lifo, now)
  pushWait(id, lifo)
  redis.call('HSET', kGroupsRep, gid, id)
  redis.call('ZADD', kGroups, now, gid)
  redis.call('ZREM', kGroupsMax, gid)
end

-- Moves the best backlog job into the wait list as the group's
-- representative, if the group may schedule one. Groups without a
-- persisted cap promote optimistically; the claim path re-checks the
-- worker's default cap and parks the job back when the group is full.
local function dispatchNext(gid, now)
  if redis.call('ZSCORE', kGroupsPaused, gid) then return end
  if redis.call('ZSCORE', kGroupsLimit, gid) then return end
  if redis.call('HGET', kGroupsRep, gid) then return end
  local backlog = backlogKey(gid)
  local head = redis.call('ZRANGE', backlog, 0, 0)
  if #head == 0 then
    redis.call('ZREM', kGroupsMax, gid)
    return
  end
  local cap = groupCap(gid)
  if cap and groupRunning(gid) >= cap then
    redis.call('ZADD', kGroupsMax, now, gid)
    return
  end
  local id = head[1]
  redis.call('ZREM', backlog, id)
  local lifo = tonumber(redis.call('HGET', jobKey(id), 'lifo') or '0')
  becomeRep(gid, id, lifo, now)
end

local function groupEnqueue(gid, id, priority, seq, lifo, now)
  redis.call('ZADD', backlogKey(gid), orderScore(priority, seq, lifo), id)
  dispatchNext(gid, now)
end

-- Pulls the representative back into the backlog, e.g. when the group is
-- paused or rate limited.
local function evictRep(gid, now)
  local rep = redis.call('HGET', kGroupsRep, gid)
  if rep then
    redis.call('LREM', kWait, 1, rep)
    local j = jobKey(rep)
    local priority = tonumber(redis.call('HGET', j, 'priority') or '0')
    local seq = tonumber(redis.call('HGET', j, 'pseq') or '0')
    local lifo = tonumber(redis.call('HGET', j, 'lifo') or '0')
    redis.call('ZADD', backlogKey(gid), orderScore(priority, seq, lifo), rep)
    redis.call('HDEL', kGroupsRep, gid)
  end
  redis.call('ZREM', kGroups, gid)
end

-- Routes a job into the collection its fields call for.
local function releaseToWaiting(id, now)
  local j = jobKey(id)
  local gid = redis.call('HGET', j, 'gid')
  local priority = tonumber(redis.call('HGET', j, 'priority') or '0')
  local seq = tonumber(redis.call('HGET', j, 'pseq') or '0')
  local lifo = tonumber(redis.call('HGET', j, 'lifo') or '0')
  if gid and gid ~= '' then
    groupEnqueue(gid, id, priority, seq, lifo, now)
  elseif priority > 0 then
    redis.call('ZADD', kPrioritized, orderScore(priority, seq, lifo), id)
  else
    pushWait(id, lifo)
  end
end

local function groupDecrement(gid)
  local running = redis.call('HINCRBY', kGroupsActive, gid, -1)
  if running < 0 then redis.call('HSET', kGroupsActive, gid, 0) end
end

local function removeJobKeys(id)
  redis.call('DEL', jobKey(id), lockKey(id), depsKey(id), processedKey(id))
end

-- Finished-set bookkeeping: keepCount 0 drops the record outright, a
-- positive count trims the oldest entries, maxAgeSecs trims by age.
local function applyRetention(zkey, id, now, keepCount, maxAgeSecs)
  if keepCount == 0 then
    removeJobKeys(id)
    return
  end
  redis.call('ZADD', zkey, now, id)
  if keepCount > 0 then
    local extra = redis.call('ZCARD', zkey) - keepCount
    if extra > 0 then
      local victims = redis.call('ZRANGE', zkey, 0, extra - 1)
      for i = 1, #victims do removeJobKeys(victims[i]) end
      redis.call('ZREMRANGEBYRANK', zkey, 0, extra - 1)
    end
  end
  if maxAgeSecs then
    local cutoff = now - maxAgeSecs * 1000
    local old = redis.call('ZRANGEBYSCORE', zkey, 0, cutoff)
    for i = 1, #old do removeJobKeys(old[i]) end
    redis.call('ZREMRANGEBYSCORE', zkey, 0, cutoff)
  end
end

-- Walks up the dependency chain failing every parent that opted in and
-- is parked in waiting-children.
local function failParentCascade(childId, now)
  local current = childId
  while true do
    local j = jobKey(current)
    local parentId = redis.call('HGET', j, 'parent')
    if not parentId or parentId == '' then return end
    if redis.call('HGET', j, 'fpof') ~= '1' then return end
    local pk = jobKey(parentId)
    if redis.call('EXISTS', pk) == 0 then return end
    if redis.call('ZREM', kWaitingChildren, parentId) == 0 then return end
    local reason = 'child ' .. prefix .. current .. ' failed'
    redis.call('HSET', pk, 'failed_reason', reason, 'finished_on', now)
    redis.call('ZADD', kFailed, now, parentId)
    emit('failed', 'jobId', parentId, 'failed_reason', reason)
    current = parentId
  end
end
"#;

/// Job creation shared by the single and bulk add scripts.
const ADD_HELPERS: &str = r#"
local function addOne(now, customId, name, data, opts, delay, priority, gid, gconc, lifo, parentId, fpof, rofCount, rofAge)
  local id = customId
  if id == '' then
    id = tostring(redis.call('INCR', kIdCounter))
  else
    local n = tonumber(id)
    if n and n > tonumber(redis.call('GET', kIdCounter) or '0') then
      redis.call('SET', kIdCounter, n)
    end
  end
  local seq = redis.call('INCR', kSeqCounter)
  redis.call('HSET', jobKey(id),
    'name', name,
    'data', data,
    'opts', opts,
    'timestamp', now,
    'delay', delay,
    'priority', priority,
    'gid', gid,
    'pseq', seq,
    'lifo', lifo,
    'attempts_made', 0,
    'stalled_count', 0,
    'parent', parentId,
    'fpof', fpof,
    'rof_count', rofCount,
    'rof_age', rofAge)
  if gconc ~= '' then
    redis.call('HSET', kGroupsConcurrency, gid, gconc)
  end
  if parentId ~= '' then
    redis.call('SADD', depsKey(parentId), id)
  end
  emit('added', 'jobId', id, 'name', name)
  if tonumber(delay) > 0 then
    redis.call('ZADD', kDelayed, delayedScore(now + tonumber(delay), id), id)
    emit('delayed', 'jobId', id)
  elseif gid ~= '' then
    groupEnqueue(gid, id, tonumber(priority), seq, tonumber(lifo), now)
    emit('waiting', 'jobId', id)
  elseif tonumber(priority) > 0 then
    redis.call('ZADD', kPrioritized, orderScore(tonumber(priority), seq, tonumber(lifo)), id)
    emit('waiting', 'jobId', id)
  else
    pushWait(id, tonumber(lifo))
    emit('waiting', 'jobId', id)
  end
  return id
end
"#;

// ARGV: prefix, now, customId, name, data, opts, delay, priority, gid,
// gconc, lifo, parentId, fpof, rofCount, rofAge
// Returns {0, id} or {-7, duplicateId} or {-1, missingParentId}.
const ADD_JOB: &str = r#"
local now = tonumber(ARGV[2])
local customId = ARGV[3]
if customId ~= '' and redis.call('EXISTS', jobKey(customId)) == 1 then
  return {-7, customId}
end
local parentId = ARGV[12]
if parentId ~= '' and redis.call('EXISTS', jobKey(parentId)) == 0 then
  return {-1, parentId}
end
local id = addOne(now, ARGV[3], ARGV[4], ARGV[5], ARGV[6], ARGV[7], ARGV[8],
  ARGV[9], ARGV[10], ARGV[11], ARGV[12], ARGV[13], ARGV[14], ARGV[15])
return {0, id}
"#;

// ARGV: prefix, now, count, then 13 args per job in addOne order.
// Validates the whole batch before applying any of it.
const ADD_BULK: &str = r#"
local now = tonumber(ARGV[2])
local count = tonumber(ARGV[3])
local seen = {}
for i = 0, count - 1 do
  local base = 4 + i * 13
  local customId = ARGV[base]
  if customId ~= '' then
    if seen[customId] or redis.call('EXISTS', jobKey(customId)) == 1 then
      return {-7, {customId}}
    end
    seen[customId] = true
  end
  local parentId = ARGV[base + 9]
  if parentId ~= '' and redis.call('EXISTS', jobKey(parentId)) == 0 then
    return {-1, {parentId}}
  end
end
local ids = {}
for i = 0, count - 1 do
  local base = 4 + i * 13
  ids[#ids + 1] = addOne(now, ARGV[base], ARGV[base + 1], ARGV[base + 2],
    ARGV[base + 3], ARGV[base + 4], ARGV[base + 5], ARGV[base + 6],
    ARGV[base + 7], ARGV[base + 8], ARGV[base + 9], ARGV[base + 10],
    ARGV[base + 11], ARGV[base + 12])
end
return {0, ids}
"#;

// ARGV: prefix, now, token, lockDuration, defaultConcurrency, rateMax,
// rateDuration, promoteBatch
// Returns nil when nothing is claimable, else {id, jobHashFields}.
const MOVE_TO_ACTIVE: &str = r#"
local now = tonumber(ARGV[2])
local token = ARGV[3]
local lockDuration = tonumber(ARGV[4])
local defaultConc = tonumber(ARGV[5])
local rateMax = tonumber(ARGV[6])
local rateDuration = tonumber(ARGV[7])
local promoteBatch = tonumber(ARGV[8])

-- Reopen groups whose rate limit expired.
local expired = redis.call('ZRANGEBYSCORE', kGroupsLimit, 0, now, 'LIMIT', 0, promoteBatch)
for i = 1, #expired do
  redis.call('ZREM', kGroupsLimit, expired[i])
  dispatchNext(expired[i], now)
end

-- Promote due delayed jobs.
local due = redis.call('ZRANGEBYSCORE', kDelayed, 0, (now + 1) * 4096 - 1, 'LIMIT', 0, promoteBatch)
for i = 1, #due do
  local id = due[i]
  redis.call('ZREM', kDelayed, id)
  redis.call('HSET', jobKey(id), 'delay', 0)
  releaseToWaiting(id, now)
  emit('waiting', 'jobId', id)
end

while true do
  local id = redis.call('RPOPLPUSH', kWait, kActive)
  if not id then
    local popped = redis.call('ZPOPMIN', kPrioritized, 1)
    if #popped == 0 then return nil end
    id = popped[1]
    redis.call('LPUSH', kActive, id)
  end
  local j = jobKey(id)
  if redis.call('EXISTS', j) == 0 then
    redis.call('LREM', kActive, 1, id)
  else
    local gid = redis.call('HGET', j, 'gid')
    local eligible = true
    if gid and gid ~= '' then
      redis.call('HDEL', kGroupsRep, gid)
      redis.call('ZREM', kGroups, gid)
      local priority = tonumber(redis.call('HGET', j, 'priority') or '0')
      local seq = tonumber(redis.call('HGET', j, 'pseq') or '0')
      local lifo = tonumber(redis.call('HGET', j, 'lifo') or '0')
      local park = nil
      if redis.call('ZSCORE', kGroupsPaused, gid) then
        park = 'paused'
      elseif redis.call('ZSCORE', kGroupsLimit, gid) then
        park = 'limited'
      else
        local cap = groupCap(gid) or defaultConc or 1
        if groupRunning(gid) >= cap then
          park = 'maxed'
        end
      end
      if not park and rateMax then
        local entry = redis.call('HGET', kGroupsRate, gid)
        local used = 0
        local windowStart = now
        if entry then
          local sep = string.find(entry, ':', 1, true)
          used = tonumber(string.sub(entry, 1, sep - 1))
          windowStart = tonumber(string.sub(entry, sep + 1))
          if now - windowStart >= rateDuration then
            used = 0
            windowStart = now
          end
        end
        if used >= rateMax then
          redis.call('ZADD', kGroupsLimit, windowStart + rateDuration, gid)
          redis.call('HDEL', kGroupsRate, gid)
          emit('group-limited', 'groupId', gid)
          park = 'limited'
        else
          redis.call('HSET', kGroupsRate, gid, (used + 1) .. ':' .. windowStart)
        end
      end
      if park then
        redis.call('LREM', kActive, 1, id)
        redis.call('ZADD', backlogKey(gid), orderScore(priority, seq, lifo), id)
        if park == 'maxed' then
          redis.call('ZADD', kGroupsMax, now, gid)
        end
        eligible = false
      else
        redis.call('HINCRBY', kGroupsActive, gid, 1)
        dispatchNext(gid, now)
      end
    end
    if eligible then
      redis.call('SET', lockKey(id), token, 'PX', lockDuration)
      redis.call('HINCRBY', j, 'attempts_made', 1)
      redis.call('HSET', j, 'processed_on', now)
      emit('active', 'jobId', id)
      return {id, redis.call('HGETALL', j)}
    end
  end
end
"#;

// ARGV: prefix, now, id, token, target, prop, stacktrace, keepCount, maxAgeSecs
const MOVE_TO_FINISHED: &str = r#"
local now = tonumber(ARGV[2])
local id = ARGV[3]
local token = ARGV[4]
local target = ARGV[5]
local prop = ARGV[6]
local stack = ARGV[7]
local keepCount = tonumber(ARGV[8])
local maxAge = tonumber(ARGV[9])

local j = jobKey(id)
if redis.call('EXISTS', j) == 0 then return -1 end
local lock = redis.call('GET', lockKey(id))
if not lock then return -2 end
if lock ~= token then return -6 end
if redis.call('LREM', kActive, 1, id) == 0 then return -3 end
redis.call('DEL', lockKey(id))

if target == 'completed' then
  redis.call('HSET', j, 'return_value', prop)
else
  redis.call('HSET', j, 'failed_reason', prop)
end
if stack ~= '' then redis.call('HSET', j, 'stacktrace', stack) end
redis.call('HSET', j, 'finished_on', now)

local gid = redis.call('HGET', j, 'gid')
if gid and gid ~= '' then
  groupDecrement(gid)
  dispatchNext(gid, now)
end

local parentId = redis.call('HGET', j, 'parent')
if parentId and parentId ~= '' then
  if target == 'completed' then
    if redis.call('EXISTS', jobKey(parentId)) == 1 then
      redis.call('SREM', depsKey(parentId), id)
      redis.call('HSET', processedKey(parentId), id, prop)
      if redis.call('SCARD', depsKey(parentId)) == 0 then
        if redis.call('ZREM', kWaitingChildren, parentId) == 1 then
          releaseToWaiting(parentId, now)
          emit('waiting', 'jobId', parentId)
        end
      end
    end
  else
    failParentCascade(id, now)
  end
end

local zkey = kCompleted
if target == 'failed' then zkey = kFailed end
applyRetention(zkey, id, now, keepCount, maxAge)
redis.call('HINCRBY', kMeta, 'count:' .. target, 1)

if target == 'completed' then
  emit('completed', 'jobId', id, 'return_value', prop)
else
  emit('failed', 'jobId', id, 'failed_reason', prop)
end
return 0
"#;

// ARGV: prefix, now, id, token, failedReason, stacktrace
const RETRY_JOB: &str = r#"
local now = tonumber(ARGV[2])
local id = ARGV[3]
local token = ARGV[4]

local j = jobKey(id)
if redis.call('EXISTS', j) == 0 then return -1 end
local lock = redis.call('GET', lockKey(id))
if not lock then return -2 end
if lock ~= token then return -6 end
if redis.call('LREM', kActive, 1, id) == 0 then return -3 end
redis.call('DEL', lockKey(id))

if ARGV[5] ~= '' then redis.call('HSET', j, 'failed_reason', ARGV[5]) end
if ARGV[6] ~= '' then redis.call('HSET', j, 'stacktrace', ARGV[6]) end

local gid = redis.call('HGET', j, 'gid')
if gid and gid ~= '' then groupDecrement(gid) end
releaseToWaiting(id, now)
emit('waiting', 'jobId', id)
return 0
"#;

// ARGV: prefix, now, id, token, delayMs, failedReason, stacktrace
const MOVE_TO_DELAYED: &str = r#"
local now = tonumber(ARGV[2])
local id = ARGV[3]
local token = ARGV[4]
local delay = tonumber(ARGV[5])

local j = jobKey(id)
if redis.call('EXISTS', j) == 0 then return -1 end
local lock = redis.call('GET', lockKey(id))
if not lock then return -2 end
if lock ~= token then return -6 end
if redis.call('LREM', kActive, 1, id) == 0 then return -3 end
redis.call('DEL', lockKey(id))

redis.call('HSET', j, 'delay', delay)
if ARGV[6] ~= '' then redis.call('HSET', j, 'failed_reason', ARGV[6]) end
if ARGV[7] ~= '' then redis.call('HSET', j, 'stacktrace', ARGV[7]) end

local gid = redis.call('HGET', j, 'gid')
if gid and gid ~= '' then
  groupDecrement(gid)
  dispatchNext(gid, now)
end

redis.call('ZADD', kDelayed, delayedScore(now + delay, id), id)
emit('delayed', 'jobId', id)
return 0
"#;

// ARGV: prefix, now, id, token
// Returns 1 without moving when the job has no pending children.
const MOVE_TO_WAITING_CHILDREN: &str = r#"
local now = tonumber(ARGV[2])
local id = ARGV[3]
local token = ARGV[4]

local j = jobKey(id)
if redis.call('EXISTS', j) == 0 then return -1 end
local lock = redis.call('GET', lockKey(id))
if not lock then return -2 end
if lock ~= token then return -6 end
if redis.call('SCARD', depsKey(id)) == 0 then return 1 end
if redis.call('LREM', kActive, 1, id) == 0 then return -3 end
redis.call('DEL', lockKey(id))

local gid = redis.call('HGET', j, 'gid')
if gid and gid ~= '' then
  groupDecrement(gid)
  dispatchNext(gid, now)
end

redis.call('ZADD', kWaitingChildren, now, id)
emit('waiting-children', 'jobId', id)
return 0
"#;

// ARGV: prefix, now, id
const PROMOTE: &str = r#"
local now = tonumber(ARGV[2])
local id = ARGV[3]
if redis.call('EXISTS', jobKey(id)) == 0 then return -1 end
if redis.call('ZREM', kDelayed, id) == 0 then return -3 end
redis.call('HSET', jobKey(id), 'delay', 0)
releaseToWaiting(id, now)
emit('promoted', 'jobId', id)
return 0
"#;

// ARGV: prefix, now, gid, pauseFlag
// Returns 1 when already in the requested state.
const PAUSE_GROUP: &str = r#"
local now = tonumber(ARGV[2])
local gid = ARGV[3]
if ARGV[4] == '1' then
  if redis.call('ZSCORE', kGroupsPaused, gid) then return 1 end
  evictRep(gid, now)
  redis.call('ZREM', kGroupsLimit, gid)
  redis.call('ZREM', kGroupsMax, gid)
  redis.call('ZADD', kGroupsPaused, now, gid)
  emit('group-paused', 'groupId', gid)
  return 0
end
if redis.call('ZREM', kGroupsPaused, gid) == 0 then return 1 end
dispatchNext(gid, now)
emit('group-resumed', 'groupId', gid)
return 0
"#;

// ARGV: prefix, now, gid, expireMs
// Paused groups win: rate limiting them is a no-op returning 1.
const RATE_LIMIT_GROUP: &str = r#"
local now = tonumber(ARGV[2])
local gid = ARGV[3]
if redis.call('ZSCORE', kGroupsPaused, gid) then return 1 end
evictRep(gid, now)
redis.call('ZREM', kGroupsMax, gid)
redis.call('ZADD', kGroupsLimit, now + tonumber(ARGV[4]), gid)
redis.call('HDEL', kGroupsRate, gid)
emit('group-limited', 'groupId', gid)
return 0
"#;

// ARGV: prefix, start, end
const GET_GROUPS: &str = r#"
local s = tonumber(ARGV[2])
local e = tonumber(ARGV[3])
return {
  redis.call('ZRANGE', kGroups, s, e),
  redis.call('ZRANGE', kGroupsLimit, s, e),
  redis.call('ZRANGE', kGroupsMax, s, e),
  redis.call('ZRANGE', kGroupsPaused, s, e)
}
"#;

// ARGV: prefix, status, start, end
// Returns a flat {gid, count, ...} array.
const GET_GROUPS_BY_STATUS: &str = r#"
local zkey
if ARGV[2] == 'waiting' then zkey = kGroups
elseif ARGV[2] == 'limited' then zkey = kGroupsLimit
elseif ARGV[2] == 'maxed' then zkey = kGroupsMax
elseif ARGV[2] == 'paused' then zkey = kGroupsPaused
else return redis.error_reply('unknown group status: ' .. ARGV[2]) end

local ids = redis.call('ZRANGE', zkey, tonumber(ARGV[3]), tonumber(ARGV[4]))
local out = {}
for i = 1, #ids do
  local gid = ids[i]
  local count = redis.call('ZCARD', backlogKey(gid))
  if redis.call('HGET', kGroupsRep, gid) then count = count + 1 end
  out[#out + 1] = gid
  out[#out + 1] = count
end
return out
"#;

// ARGV: prefix, start, limit
// Pages over group ids; returns {count, nextStart} where nextStart is -1
// on the final page.
const GET_GROUPS_JOBS_COUNT: &str = r#"
local start = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local stop = start + limit - 1
local total = 0
local more = false
local partitions = {kGroups, kGroupsLimit, kGroupsMax, kGroupsPaused}
for p = 1, 4 do
  local ids = redis.call('ZRANGE', partitions[p], start, stop)
  if #ids == limit then more = true end
  for i = 1, #ids do
    local gid = ids[i]
    total = total + redis.call('ZCARD', backlogKey(gid))
    if redis.call('HGET', kGroupsRep, gid) then total = total + 1 end
  end
end
if more then return {total, start + limit} end
return {total, -1}
"#;

// ARGV: prefix, gid, start, end
// The representative occupies conceptual index 0, the backlog follows.
const GET_GROUP_JOBS: &str = r#"
local gid = ARGV[2]
local s = tonumber(ARGV[3])
local e = tonumber(ARGV[4])
local out = {}
if e ~= -1 and e < s then return out end

local count
if e == -1 then count = -1 else count = e - s + 1 end

local bs = s
local rep = redis.call('HGET', kGroupsRep, gid)
if rep then
  if s == 0 then
    out[1] = rep
    if count > 0 then count = count - 1 end
  else
    bs = s - 1
  end
end

if count == -1 then
  local ids = redis.call('ZRANGE', backlogKey(gid), bs, -1)
  for i = 1, #ids do out[#out + 1] = ids[i] end
elseif count > 0 then
  local ids = redis.call('ZRANGE', backlogKey(gid), bs, bs + count - 1)
  for i = 1, #ids do out[#out + 1] = ids[i] end
end
return out
"#;

// ARGV: prefix, gid
const GET_GROUP_JOBS_COUNT: &str = r#"
local gid = ARGV[2]
local count = redis.call('ZCARD', backlogKey(gid))
if redis.call('HGET', kGroupsRep, gid) then count = count + 1 end
return count
"#;

// ARGV: prefix, gid, cursor, batch
// Phased deletion: '' evicts the representative, 'b' drains the backlog,
// 'd:<c>'/'w:<c>' scan the delayed and waiting-children sets for members
// of the group. Returns the next cursor, empty when done. Active jobs are
// left to finish on their own.
const DELETE_GROUP: &str = r#"
local gid = ARGV[2]
local cursor = ARGV[3]
local batch = tonumber(ARGV[4])
local backlog = backlogKey(gid)

if cursor == '' then
  local rep = redis.call('HGET', kGroupsRep, gid)
  if rep then
    redis.call('LREM', kWait, 1, rep)
    redis.call('HDEL', kGroupsRep, gid)
    removeJobKeys(rep)
  end
  redis.call('ZREM', kGroups, gid)
  cursor = 'b'
end

if cursor == 'b' then
  local ids = redis.call('ZRANGE', backlog, 0, batch - 1)
  for i = 1, #ids do removeJobKeys(ids[i]) end
  if #ids > 0 then
    redis.call('ZREMRANGEBYRANK', backlog, 0, #ids - 1)
  end
  if redis.call('ZCARD', backlog) > 0 then return 'b' end
  cursor = 'd:0'
end

local function scanPhase(zkey, phase, nextCursor)
  local zcursor = string.sub(cursor, 3)
  local result = redis.call('ZSCAN', zkey, zcursor, 'COUNT', batch)
  local entries = result[2]
  for i = 1, #entries, 2 do
    local id = entries[i]
    if redis.call('HGET', jobKey(id), 'gid') == gid then
      removeJobKeys(id)
      redis.call('ZREM', zkey, id)
    end
  end
  if result[1] == '0' then
    cursor = nextCursor
    return nil
  end
  return phase .. ':' .. result[1]
end

if string.sub(cursor, 1, 1) == 'd' then
  local more = scanPhase(kDelayed, 'd', 'w:0')
  if more then return more end
end

if string.sub(cursor, 1, 1) == 'w' then
  local more = scanPhase(kWaitingChildren, 'w', '')
  if more then return more end
end

redis.call('DEL', backlog)
redis.call('HDEL', kGroupsConcurrency, gid)
redis.call('HDEL', kGroupsRate, gid)
redis.call('HDEL', kGroupsActive, gid)
redis.call('ZREM', kGroupsLimit, gid)
redis.call('ZREM', kGroupsMax, gid)
redis.call('ZREM', kGroupsPaused, gid)
return ''
"#;

// ARGV: prefix, count, force
// Removes up to `count` job records per call; -8 when active jobs exist
// and force is off, 1 when another call is needed, 0 when the queue is
// fully gone.
const OBLITERATE: &str = r#"
local budget = tonumber(ARGV[2])
local force = ARGV[3] == '1'
if not force and redis.call('LLEN', kActive) > 0 then return -8 end

local function drainList(key)
  while budget > 0 do
    local id = redis.call('RPOP', key)
    if not id then return end
    removeJobKeys(id)
    budget = budget - 1
  end
end

local function drainZset(key)
  while budget > 0 do
    local take = budget
    if take > 100 then take = 100 end
    local ids = redis.call('ZRANGE', key, 0, take - 1)
    if #ids == 0 then return end
    for i = 1, #ids do removeJobKeys(ids[i]) end
    redis.call('ZREMRANGEBYRANK', key, 0, #ids - 1)
    budget = budget - #ids
  end
end

-- Groups go first.
local partitions = {kGroups, kGroupsLimit, kGroupsMax, kGroupsPaused}
for p = 1, 4 do
  local gids = redis.call('ZRANGE', partitions[p], 0, -1)
  for i = 1, #gids do
    if budget <= 0 then return 1 end
    local gid = gids[i]
    drainZset(backlogKey(gid))
    if redis.call('ZCARD', backlogKey(gid)) == 0 then
      redis.call('DEL', backlogKey(gid))
      redis.call('ZREM', partitions[p], gid)
      redis.call('HDEL', kGroupsRep, gid)
      redis.call('HDEL', kGroupsConcurrency, gid)
      redis.call('HDEL', kGroupsRate, gid)
      redis.call('HDEL', kGroupsActive, gid)
    end
  end
end

drainZset(kDelayed)
drainZset(kPrioritized)
drainZset(kWaitingChildren)
drainZset(kCompleted)
drainZset(kFailed)
drainList(kWait)
if force then drainList(kActive) end

if budget <= 0 then return 1 end

redis.call('DEL', kWait, kActive, kPrioritized, kDelayed, kCompleted, kFailed,
  kWaitingChildren, kGroups, kGroupsLimit, kGroupsMax, kGroupsPaused,
  kGroupsActive, kGroupsConcurrency, kGroupsRep, kGroupsRate, kEvents,
  kIdCounter, kSeqCounter, kMeta)
return 0
"#;

// ARGV: prefix, id
const GET_STATE: &str = r#"
local id = ARGV[2]
local j = jobKey(id)
if redis.call('EXISTS', j) == 0 then return 'unknown' end
if redis.call('ZSCORE', kCompleted, id) then return 'completed' end
if redis.call('ZSCORE', kFailed, id) then return 'failed' end
if redis.call('ZSCORE', kDelayed, id) then return 'delayed' end
if redis.call('ZSCORE', kWaitingChildren, id) then return 'waiting-children' end
if redis.call('LPOS', kActive, id) then return 'active' end
if redis.call('LPOS', kWait, id) then return 'waiting' end
if redis.call('ZSCORE', kPrioritized, id) then return 'waiting' end
local gid = redis.call('HGET', j, 'gid')
if gid and gid ~= '' and redis.call('ZSCORE', backlogKey(gid), id) then
  if redis.call('ZSCORE', kGroupsPaused, gid) then return 'paused' end
  return 'waiting'
end
return 'unknown'
"#;

// ARGV: prefix, id, token, value
const STORE_RESULT: &str = r#"
local id = ARGV[2]
if redis.call('EXISTS', jobKey(id)) == 0 then return -1 end
local lock = redis.call('GET', lockKey(id))
if not lock then return -2 end
if lock ~= ARGV[3] then return -6 end
redis.call('HSET', jobKey(id), 'return_value', ARGV[4])
return 0
"#;

// ARGV: prefix, now, maxStalledCount
// An active job without a lock has stalled. Returns {requeuedIds,
// failedIds}.
const MOVE_STALLED_JOBS_TO_WAIT: &str = r#"
local now = tonumber(ARGV[2])
local maxStalled = tonumber(ARGV[3])
local stalled = {}
local failed = {}
local ids = redis.call('LRANGE', kActive, 0, -1)
for i = 1, #ids do
  local id = ids[i]
  local j = jobKey(id)
  if redis.call('EXISTS', j) == 0 then
    redis.call('LREM', kActive, 1, id)
  elseif not redis.call('GET', lockKey(id)) then
    redis.call('LREM', kActive, 1, id)
    local gid = redis.call('HGET', j, 'gid')
    if gid and gid ~= '' then groupDecrement(gid) end
    local count = redis.call('HINCRBY', j, 'stalled_count', 1)
    if count > maxStalled then
      local reason = 'job stalled more than allowable limit'
      redis.call('HSET', j, 'failed_reason', reason, 'finished_on', now)
      local keep = tonumber(redis.call('HGET', j, 'rof_count') or '-1')
      local age = tonumber(redis.call('HGET', j, 'rof_age'))
      applyRetention(kFailed, id, now, keep, age)
      redis.call('HINCRBY', kMeta, 'count:failed', 1)
      failParentCascade(id, now)
      if gid and gid ~= '' then dispatchNext(gid, now) end
      emit('failed', 'jobId', id, 'failed_reason', reason)
      failed[#failed + 1] = id
    else
      releaseToWaiting(id, now)
      emit('stalled', 'jobId', id)
      stalled[#stalled + 1] = id
    end
  end
end
return {stalled, failed}
"#;

// ARGV: prefix, id, token, durationMs
const EXTEND_LOCK: &str = r#"
local id = ARGV[2]
local lock = redis.call('GET', lockKey(id))
if not lock then return -2 end
if lock ~= ARGV[3] then return -6 end
redis.call('PEXPIRE', lockKey(id), tonumber(ARGV[4]))
return 0
"#;

fn compose(parts: &[&str]) -> String {
    parts.join("\n")
}

fn script(parts: &[&str]) -> Script {
    Script::new(&compose(parts))
}

/// The full script table, loaded once per store.
pub(crate) struct Scripts {
    pub add_job: Script,
    pub add_bulk: Script,
    pub move_to_active: Script,
    pub move_to_finished: Script,
    pub retry_job: Script,
    pub move_to_delayed: Script,
    pub move_to_waiting_children: Script,
    pub promote: Script,
    pub pause_group: Script,
    pub rate_limit_group: Script,
    pub get_groups: Script,
    pub get_groups_by_status: Script,
    pub get_groups_jobs_count: Script,
    pub get_group_jobs: Script,
    pub get_group_jobs_count: Script,
    pub delete_group: Script,
    pub obliterate: Script,
    pub get_state: Script,
    pub store_result: Script,
    pub move_stalled_jobs_to_wait: Script,
    pub extend_lock: Script,
}

impl Scripts {
    pub(crate) fn new() -> Self {
        Self {
            add_job: script(&[CORE_HELPERS, ADD_HELPERS, ADD_JOB]),
            add_bulk: script(&[CORE_HELPERS, ADD_HELPERS, ADD_BULK]),
            move_to_active: script(&[CORE_HELPERS, MOVE_TO_ACTIVE]),
            move_to_finished: script(&[CORE_HELPERS, MOVE_TO_FINISHED]),
            retry_job: script(&[CORE_HELPERS, RETRY_JOB]),
            move_to_delayed: script(&[CORE_HELPERS, MOVE_TO_DELAYED]),
            move_to_waiting_children: script(&[CORE_HELPERS, MOVE_TO_WAITING_CHILDREN]),
            promote: script(&[CORE_HELPERS, PROMOTE]),
            pause_group: script(&[CORE_HELPERS, PAUSE_GROUP]),
            rate_limit_group: script(&[CORE_HELPERS, RATE_LIMIT_GROUP]),
            get_groups: script(&[CORE_HELPERS, GET_GROUPS]),
            get_groups_by_status: script(&[CORE_HELPERS, GET_GROUPS_BY_STATUS]),
            get_groups_jobs_count: script(&[CORE_HELPERS, GET_GROUPS_JOBS_COUNT]),
            get_group_jobs: script(&[CORE_HELPERS, GET_GROUP_JOBS]),
            get_group_jobs_count: script(&[CORE_HELPERS, GET_GROUP_JOBS_COUNT]),
            delete_group: script(&[CORE_HELPERS, DELETE_GROUP]),
            obliterate: script(&[CORE_HELPERS, OBLITERATE]),
            get_state: script(&[CORE_HELPERS, GET_STATE]),
            store_result: script(&[CORE_HELPERS, STORE_RESULT]),
            move_stalled_jobs_to_wait: script(&[CORE_HELPERS, MOVE_STALLED_JOBS_TO_WAIT]),
            extend_lock: script(&[CORE_HELPERS, EXTEND_LOCK]),
        }
    }

    /// Rendered sources for SCRIPT LOAD preloading, in a stable order.
    pub(crate) fn sources() -> Vec<(&'static str, String)> {
        vec![
            ("add_job", compose(&[CORE_HELPERS, ADD_HELPERS, ADD_JOB])),
            ("add_bulk", compose(&[CORE_HELPERS, ADD_HELPERS, ADD_BULK])),
            ("move_to_active", compose(&[CORE_HELPERS, MOVE_TO_ACTIVE])),
            ("move_to_finished", compose(&[CORE_HELPERS, MOVE_TO_FINISHED])),
            ("retry_job", compose(&[CORE_HELPERS, RETRY_JOB])),
            ("move_to_delayed", compose(&[CORE_HELPERS, MOVE_TO_DELAYED])),
            (
                "move_to_waiting_children",
                compose(&[CORE_HELPERS, MOVE_TO_WAITING_CHILDREN]),
            ),
            ("promote", compose(&[CORE_HELPERS, PROMOTE])),
            ("pause_group", compose(&[CORE_HELPERS, PAUSE_GROUP])),
            ("rate_limit_group", compose(&[CORE_HELPERS, RATE_LIMIT_GROUP])),
            ("get_groups", compose(&[CORE_HELPERS, GET_GROUPS])),
            (
                "get_groups_by_status",
                compose(&[CORE_HELPERS, GET_GROUPS_BY_STATUS]),
            ),
            (
                "get_groups_jobs_count",
                compose(&[CORE_HELPERS, GET_GROUPS_JOBS_COUNT]),
            ),
            ("get_group_jobs", compose(&[CORE_HELPERS, GET_GROUP_JOBS])),
            (
                "get_group_jobs_count",
                compose(&[CORE_HELPERS, GET_GROUP_JOBS_COUNT]),
            ),
            ("delete_group", compose(&[CORE_HELPERS, DELETE_GROUP])),
            ("obliterate", compose(&[CORE_HELPERS, OBLITERATE])),
            ("get_state", compose(&[CORE_HELPERS, GET_STATE])),
            ("store_result", compose(&[CORE_HELPERS, STORE_RESULT])),
            (
                "move_stalled_jobs_to_wait",
                compose(&[CORE_HELPERS, MOVE_STALLED_JOBS_TO_WAIT]),
            ),
            ("extend_lock", compose(&[CORE_HELPERS, EXTEND_LOCK])),
        ]
    }
}
