//! The built-in extraction prompt.
//!
//! The cards carry German field labels, so the prompt is German as well. It
//! asks for a bare JSON object; some models still wrap their answer in a
//! Markdown code fence, which [`crate::client`] strips before parsing.

/// The single-turn instruction we pair with each card image.
pub const EXTRACTION_PROMPT: &str = r#"Du bist ein Experte für die Digitalisierung historischer Archivkarteikarten.

Analysiere diese Karteikarte und extrahiere ALLE vorhandenen Informationen in die folgenden Felder.

REGELN:
1. Extrahiere EXAKT was auf der Karte steht, ohne zu interpretieren.
2. Komponisten-Namen haben oft das Format "Nachname, Vorname" (z.B. "Zimmermann, Rolf").
3. Signaturen haben folgende Formate:
   - Spez.XX.XXX (z.B. Spez.12.433)
   - Spez.XX.XXX [buchstabe] (z.B. Spez.16.734 w)
   - TOB XXXX (z.B. TOB 1728)
   - RTSO XXXX (z.B. RTSO 3953)
   - RTOB XXXX (z.B. RTOB 3891)
4. Wenn ein Feld leer ist, gib einen leeren String "" zurück.
5. Beachte die Labels auf der Karte: "Komponist:", "Titel:", "Signatur:", usw.
6. Bei handschriftlichem Text: bestmögliche Transkription.
7. Bei unleserlichen Stellen: markiere mit [unleserlich].

FELDER:
- Komponist: Name des Komponisten
- Signatur: Archiv-Signatur (siehe Formate oben)
- Titel: Titel des Musikstücks
- Textanfang: Anfang des Liedtexts oder zusätzliche Informationen
- Verlag: Verlagsangabe
- Material: Art des Materials (z.B. "1 Part. u. Stimmen")
- Textdichter: Name des Textdichters
- Bearbeiter: Name des Bearbeiters
- Bemerkungen: Zusätzliche Bemerkungen

AUSGABEFORMAT:
Antworte NUR mit einem validen JSON-Objekt (KEINE Markdown-Codeblöcke, KEINE Erklärungen):

{
  "Komponist": "...",
  "Signatur": "...",
  "Titel": "...",
  "Textanfang": "...",
  "Verlag": "...",
  "Material": "...",
  "Textdichter": "...",
  "Bearbeiter": "...",
  "Bemerkungen": "..."
}
"#;
