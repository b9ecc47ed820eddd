//! Zodiac signs and daily fortunes.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::NaiveDate;
use healmate_common::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZodiacSign {
    Aries,
    Taurus,
    Gemini,
    Cancer,
    Leo,
    Virgo,
    Libra,
    Scorpio,
    Sagittarius,
    Capricorn,
    Aquarius,
    Pisces,
}

impl ZodiacSign {
    pub const ALL: [ZodiacSign; 12] = [
        ZodiacSign::Aries,
        ZodiacSign::Taurus,
        ZodiacSign::Gemini,
        ZodiacSign::Cancer,
        ZodiacSign::Leo,
        ZodiacSign::Virgo,
        ZodiacSign::Libra,
        ZodiacSign::Scorpio,
        ZodiacSign::Sagittarius,
        ZodiacSign::Capricorn,
        ZodiacSign::Aquarius,
        ZodiacSign::Pisces,
    ];

    pub fn en(&self) -> &'static str {
        match self {
            Self::Aries => "Aries",
            Self::Taurus => "Taurus",
            Self::Gemini => "Gemini",
            Self::Cancer => "Cancer",
            Self::Leo => "Leo",
            Self::Virgo => "Virgo",
            Self::Libra => "Libra",
            Self::Scorpio => "Scorpio",
            Self::Sagittarius => "Sagittarius",
            Self::Capricorn => "Capricorn",
            Self::Aquarius => "Aquarius",
            Self::Pisces => "Pisces",
        }
    }

    pub fn zh(&self) -> &'static str {
        match self {
            Self::Aries => "白羊座",
            Self::Taurus => "金牛座",
            Self::Gemini => "雙子座",
            Self::Cancer => "巨蟹座",
            Self::Leo => "獅子座",
            Self::Virgo => "處女座",
            Self::Libra => "天秤座",
            Self::Scorpio => "天蠍座",
            Self::Sagittarius => "射手座",
            Self::Capricorn => "摩羯座",
            Self::Aquarius => "水瓶座",
            Self::Pisces => "雙魚座",
        }
    }

    /// Accepts `leo`, `Leo` or `獅子座`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|sign| sign.en().eq_ignore_ascii_case(s) || sign.zh() == s)
    }

    /// The sign mentioned earliest in free text, by Chinese or English name.
    ///
    /// English names only match whole words, and a bare "cancer" only counts
    /// when the text is about zodiac signs at all.
    pub fn detect(text: &str) -> Option<Self> {
        let words = ascii_words(text);
        let zodiac_talk = text.contains("星座")
            || text.contains("運勢")
            || text.to_ascii_lowercase().contains("star sign")
            || words
                .iter()
                .any(|(_, w)| ZODIAC_WORDS.iter().any(|z| w.eq_ignore_ascii_case(z)));

        Self::ALL
            .into_iter()
            .filter_map(|sign| {
                let zh = text.find(sign.zh());
                let en = (sign != Self::Cancer || zodiac_talk)
                    .then(|| {
                        words
                            .iter()
                            .find(|(_, w)| w.eq_ignore_ascii_case(sign.en()))
                            .map(|(pos, _)| *pos)
                    })
                    .flatten();
                zh.into_iter().chain(en).min().map(|pos| (pos, sign))
            })
            .min_by_key(|(pos, _)| *pos)
            .map(|(_, sign)| sign)
    }
}

const ZODIAC_WORDS: &[&str] = &["zodiac", "horoscope", "horoscopes", "astrology"];

/// Runs of ASCII letters with their byte offsets in `text`.
fn ascii_words(text: &str) -> Vec<(usize, &str)> {
    let mut words = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
        match (c.is_ascii_alphabetic(), start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                words.push((s, &text[s..i]));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        words.push((s, &text[s..]));
    }
    words
}

impl fmt::Display for ZodiacSign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.zh())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fortune {
    pub sign: ZodiacSign,
    pub date: NaiveDate,
    /// Ratings are 1 to 5 stars.
    pub overall: u8,
    pub love: u8,
    pub career: u8,
    pub wealth: u8,
    pub lucky_color: String,
    pub lucky_number: u8,
    pub summary: String,
}

#[async_trait]
pub trait HoroscopeProvider: Send + Sync {
    async fn fortune(&self, sign: ZodiacSign, date: NaiveDate) -> Result<Fortune>;
}

const LUCKY_COLORS: [&str; 10] = [
    "紅色", "橙色", "金色", "綠色", "藍色", "紫色", "白色", "粉紅色", "銀色", "米色",
];

const SUMMARIES: [&str; 5] = [
    "今天步調放慢一點，先照顧好自己的情緒。",
    "小阻礙難免，給自己多一點耐心。",
    "平穩的一天，適合整理思緒與計畫。",
    "運勢不錯，適合主動跨出一步。",
    "能量滿滿，好好把握每個機會！",
];

/// Deterministic fortunes derived from (sign, date).
pub struct AlmanacProvider;

impl AlmanacProvider {
    fn seed(sign: ZodiacSign, date: NaiveDate) -> u64 {
        // FNV-1a keeps the seed stable across builds and platforms.
        let key = format!("{}:{date}", sign.en());
        key.bytes().fold(0xcbf2_9ce4_8422_2325u64, |hash, b| {
            (hash ^ b as u64).wrapping_mul(0x0100_0000_01b3)
        })
    }

    pub fn compute(sign: ZodiacSign, date: NaiveDate) -> Fortune {
        let mut rng = StdRng::seed_from_u64(Self::seed(sign, date));
        let love = rng.gen_range(1..=5u8);
        let career = rng.gen_range(1..=5u8);
        let wealth = rng.gen_range(1..=5u8);
        let overall = ((love as u16 + career as u16 + wealth as u16 + 1) / 3) as u8;
        Fortune {
            sign,
            date,
            overall,
            love,
            career,
            wealth,
            lucky_color: LUCKY_COLORS[rng.gen_range(0..LUCKY_COLORS.len())].to_string(),
            lucky_number: rng.gen_range(1..=99),
            summary: SUMMARIES[(overall as usize).saturating_sub(1)].to_string(),
        }
    }
}

#[async_trait]
impl HoroscopeProvider for AlmanacProvider {
    async fn fortune(&self, sign: ZodiacSign, date: NaiveDate) -> Result<Fortune> {
        Ok(Self::compute(sign, date))
    }
}

/// Caches fortunes per (sign, date); entries for earlier dates are pruned.
pub struct CachedHoroscopeProvider<P: HoroscopeProvider> {
    inner: P,
    cache: parking_lot::Mutex<HashMap<(ZodiacSign, NaiveDate), Fortune>>,
}

impl<P: HoroscopeProvider> CachedHoroscopeProvider<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            cache: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().len()
    }
}

#[async_trait]
impl<P: HoroscopeProvider> HoroscopeProvider for CachedHoroscopeProvider<P> {
    async fn fortune(&self, sign: ZodiacSign, date: NaiveDate) -> Result<Fortune> {
        if let Some(hit) = self.cache.lock().get(&(sign, date)).cloned() {
            debug!(sign = %sign.en(), %date, "Horoscope cache hit");
            return Ok(hit);
        }

        let fortune = self.inner.fortune(sign, date).await?;

        let mut cache = self.cache.lock();
        cache.retain(|(_, cached_date), _| *cached_date >= date.pred_opt().unwrap_or(date));
        cache.insert((sign, date), fortune.clone());
        Ok(fortune)
    }
}
