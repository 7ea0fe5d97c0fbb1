/// Indicator phrases per language, in tie-break order.
const INDICATORS: &[(&str, &[&str])] = &[
    (
        "en",
        &[
            "dear", "hello", "please", "thank you", "thanks", "regards", "sincerely", "would",
            "could", "should", "the", "this", "that", "with", "have", "from", "your", "you",
            "we are", "i am", "looking forward",
        ],
    ),
    (
        "de",
        &[
            "sehr geehrte", "hallo", "bitte", "danke", "vielen dank", "freundliche grüße",
            "mit freundlichen", "können", "möchten", "würden", "liebe grüße", "hiermit",
            "bezüglich", "anbei", "wir haben", "ich bin",
        ],
    ),
    (
        "fr",
        &[
            "bonjour", "merci", "s'il vous plaît", "cordialement", "madame", "monsieur",
            "nous avons", "je suis", "veuillez", "cher", "chère", "avec",
        ],
    ),
    (
        "es",
        &[
            "hola", "gracias", "por favor", "saludos", "estimado", "estimada", "atentamente",
            "nosotros", "tenemos", "somos", "querido", "querida",
        ],
    ),
    (
        "it",
        &[
            "buongiorno", "grazie", "per favore", "cordiali saluti", "gentile",
            "distinti saluti", "abbiamo", "siamo", "vorrei",
        ],
    ),
    (
        "nl",
        &[
            "geachte", "bedankt", "alstublieft", "met vriendelijke groet", "hartelijk",
            "wij hebben", "graag",
        ],
    ),
    (
        "pt",
        &[
            "olá", "obrigado", "obrigada", "por favor", "atenciosamente", "prezado", "prezada",
            "cordialmente",
        ],
    ),
];

const MIN_SCORE: usize = 2;

/// Guesses the language of `text` by counting indicator phrases. Returns
/// `None` unless the best language matches at least two of them.
pub fn detect_language(text: &str) -> Option<&'static str> {
    if text.trim().is_empty() {
        return None;
    }
    let lower = text.to_lowercase();

    let mut best: Option<(&'static str, usize)> = None;
    for &(lang, words) in INDICATORS {
        let score = words.iter().filter(|w| lower.contains(*w)).count();
        if best.map_or(true, |(_, s)| score > s) {
            best = Some((lang, score));
        }
    }

    best.filter(|(_, score)| *score >= MIN_SCORE).map(|(lang, _)| lang)
}

pub struct FallbackMessage {
    pub text: &'static str,
    pub subject: &'static str,
}

/// Reply used when the model produced nothing usable.
pub fn fallback_message(language: &str) -> FallbackMessage {
    let (text, subject) = match language.trim().to_lowercase().as_str() {
        "de" => (
            "Ich konnte keine passende Antwort generieren. Bitte versuchen Sie es erneut.",
            "RE: Ihre Anfrage",
        ),
        "fr" => (
            "Je n'ai pas pu générer une réponse appropriée. Veuillez réessayer.",
            "RE: Votre demande",
        ),
        "es" => (
            "No pude generar una respuesta adecuada. Por favor, inténtelo de nuevo.",
            "RE: Su consulta",
        ),
        "it" => (
            "Non sono riuscito a generare una risposta adeguata. Per favore, riprovi.",
            "RE: La sua richiesta",
        ),
        "nl" => (
            "Ik kon geen passend antwoord genereren. Probeer het opnieuw.",
            "RE: Uw aanvraag",
        ),
        "pt" => (
            "Não foi possível gerar uma resposta adequada. Por favor, tente novamente.",
            "RE: Sua consulta",
        ),
        _ => (
            "I was unable to generate a suitable response. Please try again.",
            "RE: Your inquiry",
        ),
    };
    FallbackMessage { text, subject }
}

/// ISO 3166 alpha-2 code for a country name, `DE` when unknown.
pub fn country_code(country: Option<&str>) -> String {
    let country = match country.map(str::trim).filter(|c| !c.is_empty()) {
        Some(c) => c,
        None => return "DE".to_string(),
    };
    if country.chars().count() == 2 {
        return country.to_uppercase();
    }

    let code = match country.to_lowercase().as_str() {
        "germany" | "deutschland" => "DE",
        "austria" | "österreich" => "AT",
        "switzerland" | "schweiz" => "CH",
        "albania" => "AL",
        "belgium" => "BE",
        "bosnia and herzegovina" => "BA",
        "bulgaria" => "BG",
        "croatia" => "HR",
        "cyprus" => "CY",
        "czech republic" => "CZ",
        "denmark" => "DK",
        "estonia" => "EE",
        "finland" => "FI",
        "france" => "FR",
        "greece" => "GR",
        "hungary" => "HU",
        "iceland" => "IS",
        "ireland" => "IE",
        "italy" => "IT",
        "latvia" => "LV",
        "lithuania" => "LT",
        "luxembourg" => "LU",
        "malta" => "MT",
        "moldova" => "MD",
        "monaco" => "MC",
        "montenegro" => "ME",
        "netherlands" => "NL",
        "north macedonia" => "MK",
        "norway" => "NO",
        "poland" => "PL",
        "portugal" => "PT",
        "romania" => "RO",
        "serbia" => "RS",
        "slovakia" => "SK",
        "slovenia" => "SI",
        "spain" => "ES",
        "sweden" => "SE",
        "turkey" => "TR",
        "ukraine" => "UA",
        "united kingdom" => "GB",
        "united states" => "US",
        "canada" => "CA",
        _ => "DE",
    };
    code.to_string()
}
