use resp_proto::encode_command;

use crate::options::BenchConfig;

pub const DEFAULT_SENTINEL: &str = "__rand_int__";

/// One benchmark workload: a display title plus the RESP bytes of a single
/// command, ready to be repeated into a client's pipeline buffer.
///
/// `keysize` is the length of the composed key text (the sentinel-bearing key
/// plus its `'z'` padding). The slot scanner advances by it so adjacent slots
/// are found without rescanning the padded region; zero means the template
/// carries no composed key.
#[derive(Debug, Clone)]
pub struct Template {
    pub title: String,
    pub cmd: Vec<u8>,
    pub keysize: usize,
}

impl Template {
    fn new<A: AsRef<[u8]>>(title: &str, args: &[A], keysize: usize) -> Self {
        Self {
            title: title.to_owned(),
            cmd: encode_command(args),
            keysize,
        }
    }

    /// A command given verbatim on the command line.
    pub fn literal(args: &[String]) -> Self {
        Self {
            title: args.join(" "),
            cmd: encode_command(args),
            keysize: 0,
        }
    }

    /// Idle connections never send anything.
    pub fn idle() -> Self {
        Self {
            title: "IDLE".to_owned(),
            cmd: Vec::new(),
            keysize: 0,
        }
    }
}

/// Which benchmarks were selected with `-t`. Everything is selected when the
/// flag is absent.
#[derive(Debug, Clone)]
pub struct Selection(Option<Vec<String>>);

impl Selection {
    pub fn new(tests: &Option<Vec<String>>) -> Self {
        Self(
            tests
                .as_ref()
                .map(|names| names.iter().map(|n| n.trim().to_ascii_lowercase()).collect()),
        )
    }

    pub fn is_selected(&self, name: &str) -> bool {
        match &self.0 {
            None => true,
            Some(names) => names.iter().any(|n| n == name),
        }
    }
}

/// Compose the key text for a template: the `--kp` override or the workload's
/// literal key, padded with `'z'` placeholders covering the randomized region.
fn pack_key(cfg: &BenchConfig, key: &str) -> String {
    let mut composed = if cfg.sentinel != DEFAULT_SENTINEL {
        cfg.sentinel.clone()
    } else {
        key.to_owned()
    };
    composed.extend(std::iter::repeat('z').take(cfg.keyspacelen));
    composed
}

/// Build the selected benchmark suite, in report order.
pub fn suite(cfg: &BenchConfig, selection: &Selection) -> Vec<Template> {
    let payload = "x".repeat(cfg.datasize);
    let mut templates = Vec::new();

    if selection.is_selected("ping_inline") || selection.is_selected("ping") {
        templates.push(Template {
            title: "PING_INLINE".to_owned(),
            cmd: b"PING\r\n".to_vec(),
            keysize: 0,
        });
    }
    if selection.is_selected("ping_mbulk") || selection.is_selected("ping") {
        templates.push(Template::new("PING_BULK", &[b"PING"], 0));
    }
    if selection.is_selected("set") {
        let key = pack_key(cfg, "key:__rand_int__");
        templates.push(Template::new(
            "SET",
            &[b"SET".as_slice(), key.as_bytes(), payload.as_bytes()],
            key.len(),
        ));
    }
    if selection.is_selected("get") {
        let key = pack_key(cfg, "key:__rand_int__");
        templates.push(Template::new(
            "GET",
            &[b"GET".as_slice(), key.as_bytes()],
            key.len(),
        ));
    }
    if selection.is_selected("incr") {
        let key = pack_key(cfg, "counter:__rand_int__");
        templates.push(Template::new(
            "INCR",
            &[b"INCR".as_slice(), key.as_bytes()],
            key.len(),
        ));
    }
    if selection.is_selected("decr") {
        let key = pack_key(cfg, "counter:__rand_int__");
        templates.push(Template::new(
            "DECR",
            &[b"DECR".as_slice(), key.as_bytes()],
            key.len(),
        ));
    }
    if selection.is_selected("incrby") {
        let key = pack_key(cfg, "counter:__rand_int__");
        let increment = cfg.inc_value.to_string();
        templates.push(Template::new(
            "INCRBY",
            &[b"INCRBY".as_slice(), key.as_bytes(), increment.as_bytes()],
            key.len(),
        ));
    }
    if selection.is_selected("lpush") {
        templates.push(Template::new(
            "LPUSH",
            &[b"LPUSH".as_slice(), b"mylist", payload.as_bytes()],
            0,
        ));
    }
    if selection.is_selected("rpush") {
        templates.push(Template::new(
            "RPUSH",
            &[b"RPUSH".as_slice(), b"mylist", payload.as_bytes()],
            0,
        ));
    }
    if selection.is_selected("lpop") {
        templates.push(Template::new("LPOP", &[b"LPOP".as_slice(), b"mylist"], 0));
    }
    if selection.is_selected("rpop") {
        templates.push(Template::new("RPOP", &[b"RPOP".as_slice(), b"mylist"], 0));
    }
    if selection.is_selected("sadd") {
        let member = pack_key(cfg, "element:__rand_int__");
        templates.push(Template::new(
            "SADD",
            &[b"SADD".as_slice(), b"myset", member.as_bytes()],
            member.len(),
        ));
    }
    if selection.is_selected("zadd") {
        let key = pack_key(cfg, "myzset:__rand_int__");
        let mut args: Vec<Vec<u8>> = vec![b"ZADD".to_vec(), key.clone().into_bytes()];
        for i in 0..cfg.subkeys {
            args.push(i.to_string().into_bytes());
            args.push(format!("element:__rand_field__{i}").into_bytes());
        }
        templates.push(Template::new("ZADD", &args, key.len()));
    }
    if selection.is_selected("zrange") {
        let key = pack_key(cfg, "myzset:__rand_int__");
        templates.push(Template::new(
            "ZRANGE",
            &[b"ZRANGE".as_slice(), key.as_bytes(), b"0", b"-1", b"withscores"],
            key.len(),
        ));
    }
    if selection.is_selected("zrangebyscore") {
        let key = pack_key(cfg, "myzset:__rand_int__");
        let limit = cfg.inc_value.to_string();
        templates.push(Template::new(
            "ZRANGEBYSCORE",
            &[
                b"ZRANGEBYSCORE".as_slice(),
                key.as_bytes(),
                b"-inf",
                b"+inf",
                b"withscores",
                b"limit",
                b"0",
                limit.as_bytes(),
            ],
            key.len(),
        ));
    }
    if selection.is_selected("zrank") {
        let key = pack_key(cfg, "myzset:__rand_int__");
        templates.push(Template::new(
            "ZRANK",
            &[b"ZRANK".as_slice(), key.as_bytes(), b"element:__rand_field__0"],
            key.len(),
        ));
    }
    if selection.is_selected("hset") {
        let key = pack_key(cfg, "myset:__rand_int__");
        templates.push(Template::new(
            "HSET",
            &[
                b"HSET".as_slice(),
                key.as_bytes(),
                b"element:__rand_field__",
                payload.as_bytes(),
            ],
            key.len(),
        ));
    }
    if selection.is_selected("hget") {
        let key = pack_key(cfg, "myset:__rand_int__");
        templates.push(Template::new(
            "HGET",
            &[b"HGET".as_slice(), key.as_bytes(), b"element:__rand_field__"],
            key.len(),
        ));
    }
    if selection.is_selected("hmset") {
        let key = pack_key(cfg, "myset:__rand_int__");
        let mut args: Vec<Vec<u8>> = vec![b"HMSET".to_vec(), key.clone().into_bytes()];
        for i in 0..cfg.subkeys {
            args.push(format!("element:__rand_field__{i}").into_bytes());
            args.push(payload.clone().into_bytes());
        }
        templates.push(Template::new("HMSET", &args, key.len()));
    }
    if selection.is_selected("hmget") {
        let key = pack_key(cfg, "myset:__rand_int__");
        let mut args: Vec<Vec<u8>> = vec![b"HMGET".to_vec(), key.clone().into_bytes()];
        for i in 0..cfg.subkeys {
            args.push(format!("element:__rand_field__{i}").into_bytes());
        }
        templates.push(Template::new("HMGET", &args, key.len()));
    }
    if selection.is_selected("hkeys") {
        let key = pack_key(cfg, "myset:__rand_int__");
        templates.push(Template::new(
            "HKEYS",
            &[b"HKEYS".as_slice(), key.as_bytes()],
            key.len(),
        ));
    }
    if selection.is_selected("hincrby") {
        let key = pack_key(cfg, "myset:__rand_int__");
        let increment = cfg.inc_value.to_string();
        templates.push(Template::new(
            "HINCRBY",
            &[
                b"HINCRBY".as_slice(),
                key.as_bytes(),
                b"element:__rand_field__",
                increment.as_bytes(),
            ],
            key.len(),
        ));
    }
    if selection.is_selected("spop") {
        templates.push(Template::new("SPOP", &[b"SPOP".as_slice(), b"myset"], 0));
    }

    let lrange_tiers = [
        ("lrange_100", "LRANGE_100 (first 100 elements)", "99"),
        ("lrange_300", "LRANGE_300 (first 300 elements)", "299"),
        ("lrange_500", "LRANGE_500 (first 450 elements)", "449"),
        ("lrange_600", "LRANGE_600 (first 600 elements)", "599"),
    ];
    if selection.is_selected("lrange")
        || lrange_tiers.iter().any(|(name, _, _)| selection.is_selected(name))
    {
        templates.push(Template::new(
            "LPUSH (needed to benchmark LRANGE)",
            &[b"LPUSH".as_slice(), b"mylist", payload.as_bytes()],
            0,
        ));
    }
    for (name, title, last) in lrange_tiers {
        if selection.is_selected("lrange") || selection.is_selected(name) {
            templates.push(Template::new(
                title,
                &[b"LRANGE".as_slice(), b"mylist", b"0", last.as_bytes()],
                0,
            ));
        }
    }

    if selection.is_selected("mset") {
        let key = pack_key(cfg, "key:__rand_int__");
        let mut args: Vec<Vec<u8>> = vec![b"MSET".to_vec()];
        for _ in 0..10 {
            args.push(key.clone().into_bytes());
            args.push(payload.clone().into_bytes());
        }
        templates.push(Template::new("MSET (10 keys)", &args, key.len()));
    }

    templates
}
