//! Tarot deck, spreads and reproducible draws.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

pub const DECK_SIZE: usize = 78;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arcana {
    Major,
    Minor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Suit {
    Wands,
    Cups,
    Swords,
    Pentacles,
}

#[derive(Debug, Clone, Serialize)]
pub struct TarotCard {
    pub id: u8,
    pub name_en: String,
    pub name_zh: String,
    pub arcana: Arcana,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suit: Option<Suit>,
}

impl TarotCard {
    /// Display name, e.g. `愚者 (The Fool)`.
    pub fn display_name(&self) -> String {
        format!("{} ({})", self.name_zh, self.name_en)
    }
}

const MAJOR_ARCANA: [(&str, &str); 22] = [
    ("The Fool", "愚者"),
    ("The Magician", "魔術師"),
    ("The High Priestess", "女祭司"),
    ("The Empress", "皇后"),
    ("The Emperor", "皇帝"),
    ("The Hierophant", "教皇"),
    ("The Lovers", "戀人"),
    ("The Chariot", "戰車"),
    ("Strength", "力量"),
    ("The Hermit", "隱者"),
    ("Wheel of Fortune", "命運之輪"),
    ("Justice", "正義"),
    ("The Hanged Man", "倒吊人"),
    ("Death", "死神"),
    ("Temperance", "節制"),
    ("The Devil", "惡魔"),
    ("The Tower", "高塔"),
    ("The Star", "星星"),
    ("The Moon", "月亮"),
    ("The Sun", "太陽"),
    ("Judgement", "審判"),
    ("The World", "世界"),
];

const SUITS: [(Suit, &str, &str); 4] = [
    (Suit::Wands, "Wands", "權杖"),
    (Suit::Cups, "Cups", "聖杯"),
    (Suit::Swords, "Swords", "寶劍"),
    (Suit::Pentacles, "Pentacles", "錢幣"),
];

const RANKS: [(&str, &str); 14] = [
    ("Ace", "王牌"),
    ("Two", "二"),
    ("Three", "三"),
    ("Four", "四"),
    ("Five", "五"),
    ("Six", "六"),
    ("Seven", "七"),
    ("Eight", "八"),
    ("Nine", "九"),
    ("Ten", "十"),
    ("Page", "侍者"),
    ("Knight", "騎士"),
    ("Queen", "皇后"),
    ("King", "國王"),
];

static DECK: LazyLock<Vec<TarotCard>> = LazyLock::new(|| {
    let mut deck = Vec::with_capacity(DECK_SIZE);
    for (en, zh) in MAJOR_ARCANA {
        deck.push(TarotCard {
            id: deck.len() as u8,
            name_en: en.to_string(),
            name_zh: zh.to_string(),
            arcana: Arcana::Major,
            suit: None,
        });
    }
    for (suit, suit_en, suit_zh) in SUITS {
        for (rank_en, rank_zh) in RANKS {
            deck.push(TarotCard {
                id: deck.len() as u8,
                name_en: format!("{rank_en} of {suit_en}"),
                name_zh: format!("{suit_zh}{rank_zh}"),
                arcana: Arcana::Minor,
                suit: Some(suit),
            });
        }
    }
    deck
});

/// The full 78-card deck, ids 0..78.
pub fn deck() -> &'static [TarotCard] {
    &DECK
}

pub fn card(id: u8) -> Option<&'static TarotCard> {
    DECK.get(id as usize)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Spread {
    Single,
    ThreeCard,
    TenCardCross,
}

impl Spread {
    pub fn card_count(&self) -> usize {
        self.positions().len()
    }

    pub fn positions(&self) -> &'static [&'static str] {
        match self {
            Self::Single => &["single"],
            Self::ThreeCard => &["past", "present", "future"],
            Self::TenCardCross => &[
                "present",
                "challenge",
                "foundation",
                "recent_past",
                "crowning",
                "near_future",
                "self",
                "environment",
                "hopes_and_fears",
                "outcome",
            ],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::ThreeCard => "three-card",
            Self::TenCardCross => "ten-card-cross",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Upright,
    Reversed,
}

impl Orientation {
    pub fn zh(&self) -> &'static str {
        match self {
            Self::Upright => "正位",
            Self::Reversed => "逆位",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawnCard {
    pub card_id: u8,
    pub name: String,
    pub orientation: Orientation,
    pub position: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TarotDraw {
    pub spread: Spread,
    pub cards: Vec<DrawnCard>,
    pub seed: u64,
}

impl TarotDraw {
    /// Deal `spread` from a deck shuffled by a PRNG seeded with `seed`.
    pub fn with_seed(spread: Spread, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut ids: Vec<u8> = (0..DECK_SIZE as u8).collect();
        ids.shuffle(&mut rng);

        let cards = spread
            .positions()
            .iter()
            .zip(ids)
            .map(|(position, id)| {
                let orientation = if rng.gen_bool(0.5) {
                    Orientation::Upright
                } else {
                    Orientation::Reversed
                };
                DrawnCard {
                    card_id: id,
                    name: DECK[id as usize].display_name(),
                    orientation,
                    position: (*position).to_string(),
                }
            })
            .collect();

        Self {
            spread,
            cards,
            seed,
        }
    }

    /// Query text for looking up the drawn cards' meanings.
    pub fn meaning_query(&self) -> String {
        self.cards
            .iter()
            .map(|c| {
                let en = card(c.card_id).map(|t| t.name_en.as_str()).unwrap_or_default();
                let orientation = match c.orientation {
                    Orientation::Upright => "upright",
                    Orientation::Reversed => "reversed",
                };
                format!("{} {en} {orientation} {}", c.name, c.orientation.zh())
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Source of draw seeds, injectable so readings can be reproduced.
pub trait SeedSource: Send + Sync {
    fn next_seed(&self) -> u64;
}

/// Fresh seeds from the thread-local RNG.
pub struct EntropySeedSource;

impl SeedSource for EntropySeedSource {
    fn next_seed(&self) -> u64 {
        rand::random::<u64>()
    }
}

/// Seeds `start, start + 1, ...`, for tests and replays.
pub struct SequentialSeedSource {
    next: AtomicU64,
}

impl SequentialSeedSource {
    pub fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }
}

impl SeedSource for SequentialSeedSource {
    fn next_seed(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
