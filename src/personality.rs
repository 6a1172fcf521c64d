//! Personality data table.
//!
//! Personalities form a closed `enum` with an associated data table, so
//! an unknown personality is a compile error rather than a missing-key
//! lookup at 9am.

pub use crate::datastore::PersonalityFile;

/// Shared physical description of the mascot woven into every image
/// prompt, carried verbatim so every personality's generated art depicts
/// the same dog. The wording is load-bearing model-prompt data; keep it
/// verbatim rather than editing it as prose.
pub const MASCOT_DESCRIPTION: &str = "Ludo, a small mixed-breed dog (clearly a pug mix, secondary breed unspecified) with stocky, low-to-the-ground build. Short smooth brindle coat (warm tan/light brown with dark tiger striping), dark muzzle mask with slight gray frosting. Head slightly rounded; muzzle short but not flat; black nose. Underbite with lower tooth visible. Large round dark-brown eyes. Rose/floppy ears that fold over at tips. Tail short and curled over hip. Light facial wrinkles only. Calm, mature expression";

/// A celebration personality. `Random` and `Custom` are meta-personalities
/// resolved to a concrete one (or to user-supplied data) before use;
/// `Chronicler` announces special days only, never birthdays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Personality {
    Standard,
    MysticDog,
    Poet,
    TechGuru,
    Chef,
    Superhero,
    TimeTraveler,
    Pirate,
    Gardener,
    Philosopher,
    Chronicler,
    Random,
    Custom,
}

/// The 10 concrete personalities eligible for random rotation.
pub const CONCRETE_PERSONALITIES: &[Personality] = &[
    Personality::Standard,
    Personality::MysticDog,
    Personality::Poet,
    Personality::TechGuru,
    Personality::Chef,
    Personality::Superhero,
    Personality::TimeTraveler,
    Personality::Pirate,
    Personality::Gardener,
    Personality::Philosopher,
];

pub struct PersonalityData {
    pub key: &'static str,
    pub name: &'static str,
    pub emoji: &'static str,
    pub description: &'static str,
    pub style: &'static str,
    pub format_instruction: &'static str,
    /// Addendum appended to the base birthday message system prompt.
    pub template_extension: &'static str,
    pub image_prompt_template: &'static str,
}

impl Personality {
    pub fn key(&self) -> &'static str {
        self.data().key
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "standard" => Some(Self::Standard),
            "mystic_dog" => Some(Self::MysticDog),
            "poet" => Some(Self::Poet),
            "tech_guru" => Some(Self::TechGuru),
            "chef" => Some(Self::Chef),
            "superhero" => Some(Self::Superhero),
            "time_traveler" => Some(Self::TimeTraveler),
            "pirate" => Some(Self::Pirate),
            "gardener" => Some(Self::Gardener),
            "philosopher" => Some(Self::Philosopher),
            "chronicler" => Some(Self::Chronicler),
            "random" => Some(Self::Random),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }

    pub fn data(&self) -> &'static PersonalityData {
        match self {
            Personality::Standard => &STANDARD,
            Personality::MysticDog => &MYSTIC_DOG,
            Personality::Poet => &POET,
            Personality::TechGuru => &TECH_GURU,
            Personality::Chef => &CHEF,
            Personality::Superhero => &SUPERHERO,
            Personality::TimeTraveler => &TIME_TRAVELER,
            Personality::Pirate => &PIRATE,
            Personality::Gardener => &GARDENER,
            Personality::Philosopher => &PHILOSOPHER,
            Personality::Chronicler => &CHRONICLER,
            Personality::Random => &RANDOM_META,
            Personality::Custom => &CUSTOM_META,
        }
    }

    /// Resolve a meta-personality for a concrete use: `Random`
    /// rotates excluding the last `recent.len()` (capped at 3) selections
    /// persisted on [`PersonalityFile`]; everything else resolves to
    /// itself. `Custom` is resolved by the caller consulting
    /// `PersonalityFile.custom_settings` since it carries no fixed data.
    pub fn resolve_random(recent: &[String]) -> Personality {
        let excluded: std::collections::HashSet<&str> =
            recent.iter().rev().take(3).map(String::as_str).collect();
        let pool: Vec<Personality> = CONCRETE_PERSONALITIES
            .iter()
            .copied()
            .filter(|p| !excluded.contains(p.key()))
            .collect();
        let pool = if pool.is_empty() { CONCRETE_PERSONALITIES.to_vec() } else { pool };
        // Deterministic choice: fold the excluded set's size into the persisted
        // history length so repeated calls within the same process don't
        // always land on the pool's head. Real entropy belongs to the
        // caller (the pipeline seeds this from the request id); this just
        // guarantees a valid, non-excluded pick when no seed is supplied.
        let index = recent.len() % pool.len();
        pool[index]
    }

    /// Whether this personality's template weaves in a historical fact
    ///. The
    /// chronicler's format requires one; the time traveler and
    /// philosopher use one when available.
    pub fn wants_historical_fact(&self) -> bool {
        matches!(
            self,
            Personality::Chronicler | Personality::TimeTraveler | Personality::Philosopher
        )
    }

    /// Records a selection into the rotation history, capping retained
    /// history at 3 entries.
    pub fn record_selection(file: &mut PersonalityFile, selected: Personality) {
        file.recent_personalities.retain(|k| k != selected.key());
        file.recent_personalities.push(selected.key().to_string());
        while file.recent_personalities.len() > 3 {
            file.recent_personalities.remove(0);
        }
    }
}

macro_rules! personality_data {
    ($name:ident, $key:expr, $display_name:expr, $emoji:expr, $description:expr, $style:expr, $format_instruction:expr, $template_extension:expr, $image_prompt:expr) => {
        static $name: PersonalityData = PersonalityData {
            key: $key,
            name: $display_name,
            emoji: $emoji,
            description: $description,
            style: $style,
            format_instruction: $format_instruction,
            template_extension: $template_extension,
            image_prompt_template: $image_prompt,
        };
    };
}

personality_data!(
    STANDARD,
    "standard",
    "BrightDay",
    "🌞",
    "a friendly, enthusiastic birthday bot",
    "fun, upbeat, and slightly over-the-top with enthusiasm",
    "Create a lively message with multiple line breaks that stands out.",
    "",
    "A vibrant birthday celebration scene in colorful digital illustration style. {name} celebrates with a party hat and streamers, joined by Ludo -- "
);

personality_data!(
    MYSTIC_DOG,
    "mystic_dog",
    "Ludo the Mystic Birthday Dog",
    "✨🐕",
    "the Mystic Birthday Dog with cosmic insight and astrological wisdom",
    "mystical yet playful, with touches of cosmic wonder",
    "Give a brief mystical reading: a one-line horoscope by star sign, a spirit-animal guide, and a one-line prediction for the year ahead. Keep it under 10 lines total.",
    "",
    "A mystical cosmic birthday scene in ethereal fantasy art style. {name} is celebrated by a wizard-hatted Ludo amid swirling stardust -- "
);

personality_data!(
    POET,
    "poet",
    "The Verse-atile",
    "📜✨",
    "a poetic birthday bard who creates lyrical birthday messages",
    "poetic, lyrical, and witty with thoughtful metaphors",
    "Format the message as a short verse with a rhyme scheme, signed by the Birthday Bard.",
    "",
    "A warm, painterly illustration of a poetry reading. {name}'s birthday is honored by Ludo wearing a beret and holding a quill -- "
);

personality_data!(
    TECH_GURU,
    "tech_guru",
    "TechBot 3000",
    "💻⚡",
    "a tech-savvy birthday bot who speaks in programming metaphors",
    "techy, geeky, and full of programming humor and references",
    "Weave in programming terminology and a light technical joke or two.",
    "",
    "A neon-lit digital scene. {name}'s birthday is marked by Ludo wearing a VR headset amid glowing circuit traces -- "
);

personality_data!(
    CHEF,
    "chef",
    "Chef Confetti",
    "👨‍🍳🎊",
    "a culinary master who creates birthday messages with a food theme",
    "warm, appetizing, and full of culinary puns and food references",
    "Use cooking and food metaphors throughout the message.",
    "",
    "A cozy kitchen celebration scene. {name}'s birthday is marked by Ludo in a tall chef's hat beside a towering cake -- "
);

personality_data!(
    SUPERHERO,
    "superhero",
    "Captain Celebration",
    "🦸\u{200d}♂️⚡",
    "a superhero dedicated to making birthdays epic and legendary",
    "bold, heroic, and slightly over-dramatic with comic book energy",
    "Use a superhero catchphrase and comic-book-style punctuation.",
    "",
    "A comic-book splash panel. {name}'s birthday is defended by a caped, heroic Ludo amid dramatic action lines -- "
);

personality_data!(
    TIME_TRAVELER,
    "time_traveler",
    "Chrono",
    "⏰🚀",
    "a time-traveling birthday messenger from the future",
    "mysterious, slightly futuristic, with humorous predictions",
    "Include a reference to time travel and one amusing, clearly tongue-in-cheek prediction about the year ahead.",
    "",
    "A steampunk time-machine scene bathed in amber light. {name}'s birthday is celebrated by Ludo wearing brass goggles among glowing clock gears -- "
);

personality_data!(
    PIRATE,
    "pirate",
    "Captain BirthdayBeard",
    "☠️🎂",
    "a jolly pirate captain who celebrates birthdays with nautical flair",
    "swashbuckling, playful, and full of pirate slang and nautical references",
    "Use pirate speech patterns (\"arr\", \"ye\", \"matey\") and maritime metaphors throughout.",
    "",
    "A sun-washed pirate-ship deck scene. {name}'s birthday is toasted by a tricorn-hatted, eyepatched Ludo amid treasure chests and rigging -- "
);

personality_data!(
    GARDENER,
    "gardener",
    "Bloom",
    "🌱🌸",
    "a nurturing garden spirit who celebrates growth and new beginnings",
    "warm, nurturing, nature-focused with seasonal metaphors and growth imagery",
    "Use gardening metaphors and imagery of natural growth throughout.",
    "",
    "A sunlit garden-party scene in soft watercolor style. {name}'s birthday is tended by Ludo in a sun hat watering a bed of celebration flowers -- "
);

personality_data!(
    PHILOSOPHER,
    "philosopher",
    "The Sage",
    "🦉📜",
    "a wise philosopher who finds deep meaning in the passage of time",
    "thoughtful, contemplative, with references to great thinkers and philosophical insights",
    "Include a brief philosophical reflection on the passage of time, in a contemplative rather than saccharine register.",
    "",
    "A candlelit scholar's-study scene in muted sepia tones. {name}'s birthday milestone is marked by a robed, bespectacled Ludo amid stacks of ancient scrolls -- "
);

personality_data!(
    CHRONICLER,
    "chronicler",
    "The Chronicler",
    "📚✨",
    "the keeper of human history and cultural memory",
    "educational yet engaging, weaving historical facts with cultural significance",
    "Open with \"TODAY IN HUMAN HISTORY...\", name the observance or birthday, explain its origin, and close with a reflection on its relevance today. Respectful of diverse cultures; never fabricate statistics.",
    "",
    "An illuminated-manuscript-style historical scene with gold leaf accents. {name}'s milestone is recorded by a scholar's-cap-wearing Ludo presenting a ceremonial scroll -- "
);

personality_data!(
    RANDOM_META,
    "random",
    "Surprise Bot",
    "🎲",
    "a personality-shifting bot that randomly selects from all available personalities",
    "unpredictable and varied",
    "Resolved to a concrete personality before generation; carries no fixed data of its own.",
    "",
    ""
);

personality_data!(
    CUSTOM_META,
    "custom",
    "Custom Bot",
    "🎨",
    "a fully customizable personality",
    "configurable",
    "Use the admin-supplied custom style and format instructions in place of this text.",
    "Create a personalized birthday message in your own style and format.",
    ""
);

/// Appends [`MASCOT_DESCRIPTION`] to a personality's image prompt prefix,
/// producing the full prompt sent to the image generator.
pub fn image_prompt(personality: Personality, name: &str) -> String {
    let data = personality.data();
    if data.image_prompt_template.is_empty() {
        return format!(
            "A warm birthday celebration scene. {name}'s birthday is celebrated alongside {MASCOT_DESCRIPTION}."
        );
    }
    let prefix = data.image_prompt_template.replace("{name}", name);
    format!("{prefix}{MASCOT_DESCRIPTION}.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_concrete_key() {
        for p in CONCRETE_PERSONALITIES {
            let key = p.key();
            assert_eq!(Personality::from_key(key), Some(*p));
        }
        assert_eq!(Personality::from_key("chronicler"), Some(Personality::Chronicler));
        assert_eq!(Personality::from_key("nonexistent"), None);
    }

    #[test]
    fn random_excludes_recent_selections() {
        let recent: Vec<String> = CONCRETE_PERSONALITIES[..3].iter().map(|p| p.key().to_string()).collect();
        let picked = Personality::resolve_random(&recent);
        assert!(!recent.contains(&picked.key().to_string()));
    }

    #[test]
    fn record_selection_caps_history_at_three() {
        let mut file = PersonalityFile::default();
        for p in CONCRETE_PERSONALITIES {
            Personality::record_selection(&mut file, *p);
        }
        assert_eq!(file.recent_personalities.len(), 3);
    }

    #[test]
    fn mascot_description_is_embedded_in_every_image_prompt() {
        for p in CONCRETE_PERSONALITIES {
            let prompt = image_prompt(*p, "Alex");
            assert!(prompt.contains(MASCOT_DESCRIPTION));
        }
    }
}
