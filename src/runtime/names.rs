//! Random container names in `adjective_surname` form.

use rand::Rng;
use rand::seq::SliceRandom;

const LEFT: &[&str] = &[
    "admiring", "adoring", "affectionate", "agitated", "amazing", "angry", "awesome",
    "beautiful", "blissful", "bold", "boring", "brave", "busy", "charming", "clever",
    "compassionate", "competent", "condescending", "confident", "cool", "cranky", "crazy",
    "dazzling", "determined", "distracted", "dreamy", "eager", "ecstatic", "elastic",
    "elated", "elegant", "eloquent", "epic", "exciting", "fervent", "festive", "flamboyant",
    "focused", "friendly", "frosty", "funny", "gallant", "gifted", "goofy", "gracious",
    "great", "happy", "hardcore", "heuristic", "hopeful", "hungry", "infallible", "inspiring",
    "intelligent", "interesting", "jolly", "jovial", "keen", "kind", "laughing", "loving",
    "lucid", "magical", "modest", "musing", "mystifying", "naughty", "nervous", "nice",
    "nifty", "nostalgic", "objective", "optimistic", "peaceful", "pedantic", "pensive",
    "practical", "priceless", "quirky", "quizzical", "recursing", "relaxed", "reverent",
    "romantic", "sad", "serene", "sharp", "silly", "sleepy", "stoic", "strange", "stupefied",
    "suspicious", "sweet", "tender", "thirsty", "trusting", "unruffled", "upbeat", "vibrant",
    "vigilant", "vigorous", "wizardly", "wonderful", "xenodochial", "youthful", "zealous",
    "zen",
];

const RIGHT: &[&str] = &[
    "agnesi", "albattani", "allen", "almeida", "archimedes", "ardinghelli", "aryabhata",
    "austin", "babbage", "banach", "bardeen", "bartik", "bassi", "bell", "bhabha", "blackwell",
    "bohr", "booth", "borg", "bose", "boyd", "brahmagupta", "brattain", "brown", "carson",
    "chandrasekhar", "curie", "darwin", "davinci", "dijkstra", "dubinsky", "easley", "einstein",
    "elion", "engelbart", "euclid", "euler", "fermat", "fermi", "feynman", "franklin",
    "galileo", "gates", "goldberg", "goldstine", "goldwasser", "golick", "goodall", "hamilton",
    "hawking", "heisenberg", "hermann", "hodgkin", "hoover", "hopper", "hugle", "hypatia",
    "jang", "jennings", "jepsen", "joliot", "jones", "kalam", "kare", "keller", "kepler",
    "khorana", "kilby", "kirch", "knuth", "kowalevski", "lalande", "lamarr", "lamport",
    "leakey", "leavitt", "lewin", "lichterman", "liskov", "lovelace", "lumiere", "mahavira",
    "mayer", "mccarthy", "mcclintock", "mclean", "mcnulty", "meitner", "mestorf", "mirzakhani",
    "morse", "murdock", "newton", "nightingale", "nobel", "noether", "northcutt", "noyce",
    "panini", "pare", "pasteur", "payne", "perlman", "pike", "poincare", "poitras", "ptolemy",
    "raman", "ramanujan", "ride", "ritchie", "roentgen", "rosalind", "saha", "sammet",
    "shannon", "shaw", "shirley", "shockley", "sinoussi", "snyder", "spence", "stallman",
    "stonebraker", "swanson", "swartz", "swirles", "tesla", "thompson", "torvalds", "turing",
    "varahamihira", "visvesvaraya", "volhard", "wescoff", "wiles", "williams", "wilson",
    "wing", "wozniak", "wright", "yalow", "yonath",
];

/// Returns a random name. A nonzero `retry` appends a random digit so a
/// second attempt after a collision draws from a different name space.
pub fn generate(retry: u32) -> String {
    let mut rng = rand::thread_rng();
    let left = LEFT.choose(&mut rng).copied().unwrap_or("quiet");
    let right = RIGHT.choose(&mut rng).copied().unwrap_or("lovelace");
    if retry > 0 {
        format!("{}_{}{}", left, right, rng.gen_range(0..10))
    } else {
        format!("{}_{}", left, right)
    }
}
