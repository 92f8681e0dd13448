/// Questions asked by the intake, in presentation order.
pub fn default_script() -> Vec<String> {
    vec![
        "¿Cómo describirías la calidad de los productos que has adquirido en nuestra tienda? \
         ¿Cumplen con tus expectativas en términos de durabilidad, diseño y funcionalidad?"
            .to_string(),
        "¿Cuán satisfecho estás con el nivel de atención y servicio al cliente que has recibido \
         durante tu última visita o compra en nuestra tienda? ¿Hubo algo en particular que te \
         llamó la atención (positiva o negativamente)?"
            .to_string(),
        "Si tuvieras que recomendar nuestros productos o servicios a alguien más, ¿qué aspectos \
         destacarías y qué áreas sientes que podrían ser mejoradas para ofrecer una experiencia \
         más completa y agradable?"
            .to_string(),
    ]
}

pub const CLOSING_MESSAGE: &str =
    "¡Gracias por tus respuestas! Tu opinión es muy importante para nosotros.";

pub const SUBMISSION_FAILED_MESSAGE: &str =
    "Ocurrió un error al procesar tus respuestas. Inténtalo más tarde.";

pub const INVALID_EMAIL_MESSAGE: &str = "El formato del correo no es válido.";

pub const UNKNOWN_EMAIL_MESSAGE: &str =
    "El correo no está registrado. Por favor, ingresa uno válido.";

pub const EMPTY_ANSWER_MESSAGE: &str = "Escribe una respuesta antes de continuar.";

/// Progress line shown above each question.
pub fn question_header(index: usize, total: usize) -> String {
    format!("Pregunta {} de {}", index + 1, total)
}
