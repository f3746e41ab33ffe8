use indexmap::IndexMap;

/// Insertion-ordered request headers with lowercase names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSet {
    entries: IndexMap<String, String>,
}

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites, keeping the original position of an existing name.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.entries.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Copy without the named headers, e.g. the randomized subset.
    pub fn without(&self, names: &[&str]) -> HeaderSet {
        let entries = self
            .entries
            .iter()
            .filter(|(name, _)| !names.iter().any(|skip| skip.eq_ignore_ascii_case(name)))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        HeaderSet { entries }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderCandidates {
    pub name: String,
    pub values: Vec<String>,
}

/// Fixed defaults, randomization candidates and the completion-only overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderProfile {
    pub defaults: Vec<(String, String)>,
    pub candidates: Vec<HeaderCandidates>,
    pub chat_overlay: Vec<(String, String)>,
}

impl HeaderProfile {
    pub fn chrome_windows(base_url: &str) -> Self {
        let base_url = base_url.trim_end_matches('/');
        let pairs = |rows: &[(&str, &str)]| {
            rows.iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect::<Vec<(String, String)>>()
        };
        let candidates = |name: &str, values: &[&str]| HeaderCandidates {
            name: name.to_string(),
            values: values.iter().map(|value| value.to_string()).collect(),
        };

        let mut defaults = pairs(&[
            ("accept", "application/json"),
            ("accept-language", "zh-CN,zh;q=0.9"),
            ("content-type", "application/json; charset=UTF-8"),
            (
                "sec-ch-ua",
                r#""Chromium";v="140", "Not=A?Brand";v="24", "Google Chrome";v="140""#,
            ),
            ("sec-ch-ua-mobile", "?0"),
            ("sec-ch-ua-platform", r#""Windows""#),
            ("sec-fetch-dest", "empty"),
            ("sec-fetch-mode", "cors"),
            ("sec-fetch-site", "same-origin"),
            ("source", "web"),
            (
                "user-agent",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36",
            ),
        ]);
        defaults.push(("referer".to_string(), format!("{base_url}/")));

        let guest_referer = format!("{base_url}/c/guest");
        let landing_referer = format!("{base_url}/");

        Self {
            defaults,
            candidates: vec![
                candidates(
                    "user-agent",
                    &[
                        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36",
                        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/139.0.0.0 Safari/537.36",
                        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36 Edg/140.0.0.0",
                        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36",
                    ],
                ),
                candidates(
                    "sec-ch-ua",
                    &[
                        r#""Chromium";v="140", "Not=A?Brand";v="24", "Google Chrome";v="140""#,
                        r#""Not)A;Brand";v="8", "Chromium";v="139", "Google Chrome";v="139""#,
                        r#""Chromium";v="140", "Not=A?Brand";v="24", "Microsoft Edge";v="140""#,
                    ],
                ),
                candidates("sec-ch-ua-mobile", &["?0"]),
                candidates(
                    "sec-ch-ua-platform",
                    &[r#""Windows""#, r#""macOS""#, r#""Linux""#],
                ),
                candidates("sec-fetch-mode", &["cors"]),
                candidates("sec-fetch-dest", &["empty"]),
                candidates("sec-fetch-site", &["same-origin", "same-site"]),
                HeaderCandidates {
                    name: "referer".to_string(),
                    values: vec![landing_referer, guest_referer],
                },
            ],
            chat_overlay: pairs(&[
                ("accept", "*/*"),
                ("authorization", "Bearer"),
                ("x-accel-buffering", "no"),
            ]),
        }
    }

    pub fn randomized_names(&self) -> Vec<&str> {
        self.candidates
            .iter()
            .filter(|row| !row.values.is_empty())
            .map(|row| row.name.as_str())
            .collect()
    }

    pub fn candidates_for(&self, name: &str) -> Option<&[String]> {
        self.candidates
            .iter()
            .find(|row| row.name.eq_ignore_ascii_case(name))
            .map(|row| row.values.as_slice())
    }
}
