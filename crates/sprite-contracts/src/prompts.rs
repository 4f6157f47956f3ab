pub const MIN_GRID: u32 = 2;
pub const MAX_GRID: u32 = 6;
pub const DEFAULT_GRID: u32 = 4;

const CHARACTERS: [&str; 24] = [
    "baby dragon",
    "fluffy cloud cat",
    "crystal fox",
    "bouncy slime",
    "chubby penguin knight",
    "tiny fire spirit",
    "cosmic hamster",
    "mini phoenix chick",
    "bubble frog mage",
    "thunder puppy",
    "sparkle unicorn",
    "pocket griffin",
    "mushroom alchemist",
    "little robot companion",
    "starry owl wizard",
    "honey bee ranger",
    "tiny samurai cat",
    "aurora fox mage",
    "bamboo panda warrior",
    "clockwork bird",
    "jade rabbit monk",
    "lavender wolf archer",
    "gentle stone giant",
    "giant cloud whale",
];

const STYLES: [&str; 12] = [
    "clean pixel art",
    "vibrant anime",
    "cel-shaded cartoon",
    "pastel dreamlike",
    "watercolor wash",
    "retro arcade",
    "cozy storybook",
    "chibi kawaii",
    "neon glow",
    "colorful flat design",
    "8-bit classic",
    "Studio Ghibli inspired",
];

const DEFAULT_SUBJECTS: [&str; 5] = [
    "baby dragon",
    "crystal fox",
    "tiny samurai cat",
    "sparkle unicorn",
    "bamboo panda warrior",
];

const DEFAULT_STYLES: [&str; 5] = [
    "clean pixel art",
    "chibi kawaii",
    "pastel dreamlike",
    "cozy storybook",
    "Studio Ghibli inspired",
];

pub fn clamp_grid(value: u32) -> u32 {
    value.clamp(MIN_GRID, MAX_GRID)
}

/// Grid sizes are spelled out in prompts; models render digits into the art.
pub fn grid_word(grid_size: u32) -> &'static str {
    match grid_size {
        2 => "two",
        3 => "three",
        5 => "five",
        6 => "six",
        _ => "four",
    }
}

/// Deterministic pick from the character and style tables.
pub fn random_prompt(seed: u128) -> String {
    let character = CHARACTERS[(seed % CHARACTERS.len() as u128) as usize];
    let style = STYLES[((seed >> 64) % STYLES.len() as u128) as usize];
    format!("{character}, {style}, isometric action RPG")
}

/// Stand-in for a blank single-sprite request; draws from a shorter list
/// than the batch tables.
pub fn default_prompt(seed: u128) -> String {
    let subject = DEFAULT_SUBJECTS[(seed % DEFAULT_SUBJECTS.len() as u128) as usize];
    let style = DEFAULT_STYLES[((seed >> 64) % DEFAULT_STYLES.len() as u128) as usize];
    format!("{subject}, {style}, isometric action RPG")
}

pub fn rewrite_user_prompt(base_prompt: &str, grid_size: u32) -> String {
    format!(
        "Design the character and choreograph a {}-beat animation loop for: {base_prompt}",
        grid_word(grid_size)
    )
}

pub fn build_rewrite_system_prompt(grid_size: u32) -> String {
    let word = grid_word(grid_size);
    [
        "You are an animation director and character designer for a sprite sheet pipeline.".to_string(),
        "Given a character concept, return exactly two sections, nothing else:".to_string(),
        String::new(),
        "CHARACTER: a vivid, specific description of the character's appearance, silhouette and art style.".to_string(),
        String::new(),
        format!("CHOREOGRAPHY: a {word}-beat continuous animation loop unique to this character. Each beat is one row of the sheet and the last beat flows back into the first."),
        "Describe body position, weight and motion arc for each beat in one sentence.".to_string(),
        String::new(),
        "RULES:".to_string(),
        "- Never use numbers or digits.".to_string(),
        "- Never mention grids, pixels, frames, cells, sprite sheets or image generation.".to_string(),
        format!("- The {word} beats must form one fluid, looping performance."),
    ]
    .join("\n")
}

pub fn build_sprite_prompt(base_prompt: &str, grid_size: u32) -> String {
    let word = grid_word(grid_size);
    [
        "STRICT TECHNICAL REQUIREMENTS FOR THIS IMAGE:".to_string(),
        String::new(),
        format!("FORMAT: A single image containing a {word}-by-{word} grid of equally sized cells."),
        "Every cell has the exact same dimensions, perfectly aligned, with no gaps or overlap.".to_string(),
        String::new(),
        "FORBIDDEN: no text, numbers, letters, labels, watermarks or UI elements anywhere.".to_string(),
        String::new(),
        "CONSISTENCY: the exact same single character in every cell, same proportions and camera angle.".to_string(),
        "Isometric three-quarter view, full body visible, against a plain solid flat-color background.".to_string(),
        String::new(),
        "ANIMATION FLOW: cells read left-to-right, top-to-bottom as one continuous motion.".to_string(),
        format!("Each row contains {word} phases of the motion. The very last cell loops back seamlessly to the very first cell."),
        String::new(),
        "CHARACTER AND ANIMATION DIRECTION:".to_string(),
        base_prompt.to_string(),
    ]
    .join("\n")
}

/// Filename-safe slug: lowercase ASCII alphanumerics joined by `-`, at most
/// `max_chars` long.
pub fn slugify(text: &str, max_chars: usize) -> String {
    let mut slug = String::new();
    let mut in_gap = false;
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            in_gap = false;
        } else if !in_gap {
            slug.push('-');
            in_gap = true;
        }
    }
    slug.chars().take(max_chars).collect()
}
